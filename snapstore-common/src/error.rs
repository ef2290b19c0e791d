use std::time::Duration;

/// Errors produced by the snapshot store and its backends.
#[derive(Debug, thiserror::Error)]
pub enum SnapstoreError {
    /// Bad or missing configuration value, including malformed boolean flags.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("credentials unavailable: {0}")]
    CredentialsUnavailable(String),

    #[error("container {0} does not exist")]
    ContainerNotFound(String),

    #[error("invalid snapshot name {name}: {reason}")]
    InvalidSnapshotName { name: String, reason: String },

    /// A chunk could not be staged within its attempt budget.
    #[error("failed uploading chunk, id: {id}, offset: {offset}, attempt: {attempt}: {source}")]
    ChunkUpload {
        id: u64,
        offset: u64,
        attempt: u32,
        #[source]
        source: Box<SnapstoreError>,
    },

    /// The upload worker pool stopped before every chunk was staged.
    #[error("chunk upload worker failed: {0}")]
    UploadWorker(String),

    #[error("object {0} not found")]
    ObjectNotFound(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("{operation} failed: HTTP {status} - {body}")]
    Service {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{operation}: {source}")]
    Operation {
        operation: String,
        #[source]
        source: Box<SnapstoreError>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl SnapstoreError {
    /// Wrap the error with the operation that produced it.
    pub fn context(self, operation: impl Into<String>) -> Self {
        SnapstoreError::Operation {
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through `Operation` and `ChunkUpload` wrappers.
    pub fn root(&self) -> &SnapstoreError {
        match self {
            SnapstoreError::Operation { source, .. } | SnapstoreError::ChunkUpload { source, .. } => {
                source.root()
            }
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), SnapstoreError::ObjectNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, SnapstoreError>;
