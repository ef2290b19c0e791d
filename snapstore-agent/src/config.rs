use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use snapstore_common::snapshot::{BACKUP_VERSION_V1, BACKUP_VERSION_V2};

const DEFAULT_TEMP_DIR: &str = "/tmp";
const DEFAULT_MAX_PARALLEL_CHUNK_UPLOADS: usize = 5;
const DEFAULT_MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024; // 5 MiB
const DEFAULT_MAX_CHUNK_UPLOAD_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Provider {
    /// Azure Blob Storage.
    #[serde(rename = "ABS", alias = "abs", alias = "azure")]
    Abs,
    /// Local directory treated as a container.
    #[serde(rename = "Local", alias = "local", alias = "directory")]
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapstoreConfig {
    pub provider: Provider,
    /// Azure container name, or the base directory for `Local`.
    pub container: String,
    /// Store prefix; its last segment is the naming-version tag, e.g. `etcd-main/v2`.
    pub prefix: String,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_max_parallel_chunk_uploads")]
    pub max_parallel_chunk_uploads: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    #[serde(default = "default_max_chunk_upload_attempts")]
    pub max_chunk_upload_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Read credentials from the `SOURCE_` prefixed environment.
    #[serde(default)]
    pub is_source: bool,
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TEMP_DIR)
}

fn default_max_parallel_chunk_uploads() -> usize {
    DEFAULT_MAX_PARALLEL_CHUNK_UPLOADS
}

fn default_min_chunk_size() -> u64 {
    DEFAULT_MIN_CHUNK_SIZE
}

fn default_max_chunk_upload_attempts() -> u32 {
    DEFAULT_MAX_CHUNK_UPLOAD_ATTEMPTS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

impl SnapstoreConfig {
    /// Config with defaults for everything but the required fields.
    pub fn new(provider: Provider, container: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            provider,
            container: container.into(),
            prefix: prefix.into(),
            temp_dir: default_temp_dir(),
            max_parallel_chunk_uploads: DEFAULT_MAX_PARALLEL_CHUNK_UPLOADS,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            max_chunk_upload_attempts: DEFAULT_MAX_CHUNK_UPLOAD_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            is_source: false,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: SnapstoreConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.container.is_empty() {
            anyhow::bail!("container must not be empty");
        }
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            anyhow::bail!("prefix must not be empty");
        }
        let tag = prefix.rsplit('/').next().unwrap_or_default();
        if tag != BACKUP_VERSION_V1 && tag != BACKUP_VERSION_V2 {
            anyhow::bail!(
                "prefix {} must end with a naming-version segment ({} or {})",
                self.prefix,
                BACKUP_VERSION_V1,
                BACKUP_VERSION_V2
            );
        }
        if self.max_parallel_chunk_uploads == 0 {
            anyhow::bail!("max_parallel_chunk_uploads must be at least 1");
        }
        if self.min_chunk_size == 0 {
            anyhow::bail!("min_chunk_size must be greater than zero");
        }
        if self.max_chunk_upload_attempts == 0 {
            anyhow::bail!("max_chunk_upload_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
