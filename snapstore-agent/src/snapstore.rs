//! Snapshot store facade over a [`ContainerClient`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use snapstore_common::backend::{ContainerClient, SnapReader};
use snapstore_common::snapshot::{
    adapt_prefix, has_version_tag, listing_prefix, parse_snapshot, snapshot_path, SnapList,
    Snapshot,
};
use snapstore_common::{Result, SnapstoreError};

use crate::config::SnapstoreConfig;
use crate::uploader::{self, with_deadline, UploadOptions, CHUNK_UPLOAD_TIMEOUT};

/// Deadline for a listing page or the container existence check.
pub const PROVIDER_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for opening a download stream.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const STAGING_FILE_PREFIX: &str = "etcd-backup-";

pub struct SnapStore {
    container_name: String,
    container: Arc<dyn ContainerClient>,
    prefix: String,
    temp_dir: PathBuf,
    upload: UploadOptions,
}

impl SnapStore {
    pub fn new(config: &SnapstoreConfig, container: Arc<dyn ContainerClient>) -> Self {
        Self {
            container_name: config.container.clone(),
            container,
            prefix: config.prefix.trim_end_matches('/').to_string(),
            temp_dir: config.temp_dir.clone(),
            upload: UploadOptions {
                chunk_size: config.min_chunk_size,
                max_parallel: config.max_parallel_chunk_uploads,
                max_attempts: config.max_chunk_upload_attempts,
                retry_backoff: config.retry_backoff(),
                operation_timeout: CHUNK_UPLOAD_TIMEOUT,
            },
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn upload_options(&self) -> &UploadOptions {
        &self.upload
    }

    /// Open a download stream for `snap`. The caller owns the stream.
    pub async fn fetch(&self, snap: &Snapshot) -> Result<SnapReader> {
        let name = snap.path();
        debug!(container = %self.container_name, blob = %name, "Fetching snapshot");
        let blob = self.container.block_blob_client(&name);
        with_deadline(
            format!("open download stream for {}", name),
            DOWNLOAD_TIMEOUT,
            blob.download_stream(),
        )
        .await
        .map_err(|e| e.context(format!("fetch snapshot {}", name)))
    }

    /// Every snapshot of every naming generation under the store's base
    /// prefix, sorted. Unparsable names are skipped.
    pub async fn list(&self) -> Result<SnapList> {
        let prefix = listing_prefix(&self.prefix);
        let mut pager = self.container.list_blobs_flat(&prefix);
        let mut seen = HashSet::new();
        let mut snap_list = SnapList::new();
        let mut pages = 0usize;

        while pager.more() {
            let names = with_deadline(
                format!("list blobs page {}", pages + 1),
                PROVIDER_CONNECTION_TIMEOUT,
                pager.next_page(),
            )
            .await
            .map_err(|e| e.context(format!("list snapshots under prefix '{}'", prefix)))?;
            pages += 1;

            for name in names {
                if !has_version_tag(&name) || !seen.insert(name.clone()) {
                    continue;
                }
                match parse_snapshot(&name) {
                    Ok(snap) => snap_list.push(snap),
                    Err(e) => warn!(blob = %name, error = %e, "Invalid snapshot found, ignoring"),
                }
            }
        }

        snap_list.sort();
        debug!(prefix = %prefix, pages, snapshots = snap_list.len(), "Listed snapshots");
        Ok(snap_list)
    }

    /// Stage `reader` to a local temporary file and upload it as `snap`.
    ///
    /// `reader` is dropped before this returns, and the staged file is
    /// removed on every path.
    pub async fn save(&self, snap: &Snapshot, reader: SnapReader) -> Result<()> {
        let name = snapshot_path(
            &adapt_prefix(snap, &self.prefix),
            &snap.snap_dir,
            &snap.snap_name,
        );

        let staged = tempfile::Builder::new()
            .prefix(STAGING_FILE_PREFIX)
            .tempfile_in(&self.temp_dir)
            .map_err(|e| {
                SnapstoreError::from(e)
                    .context(format!("create temporary file in {}", self.temp_dir.display()))
            })?;

        let size = stage(reader, &staged)
            .await
            .map_err(|e| e.context(format!("stage snapshot {} to local file", name)))?;
        info!(blob = %name, size, staged = %staged.path().display(), "Staged snapshot for upload");

        let blob = self.container.block_blob_client(&name);
        uploader::upload_file(staged.path(), size, blob, &self.upload)
            .await
            .map_err(|e| e.context(format!("upload snapshot {}", name)))?;

        info!(container = %self.container_name, blob = %name, size, "Snapshot saved");
        Ok(())
    }

    /// Delete `snap`. A missing object is reported as `ObjectNotFound`.
    pub async fn delete(&self, snap: &Snapshot) -> Result<()> {
        let name = snap.path();
        let blob = self.container.block_blob_client(&name);
        blob.delete()
            .await
            .map_err(|e| e.context(format!("delete snapshot {}", name)))?;
        info!(container = %self.container_name, blob = %name, "Snapshot deleted");
        Ok(())
    }
}

/// Copy `reader` into the staged file and return the number of bytes written.
async fn stage(mut reader: SnapReader, staged: &tempfile::NamedTempFile) -> Result<u64> {
    let mut file = tokio::fs::File::from_std(staged.as_file().try_clone()?);
    let size = tokio::io::copy(&mut reader, &mut file).await?;
    drop(reader);
    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::directory::DirectoryContainer;
    use crate::config::Provider;

    #[test]
    fn test_upload_options_from_config() {
        let mut config = SnapstoreConfig::new(Provider::Local, "/srv", "etcd/v2/");
        config.min_chunk_size = 1024;
        config.max_parallel_chunk_uploads = 3;
        config.max_chunk_upload_attempts = 2;
        config.retry_backoff_ms = 50;

        let dir = tempfile::tempdir().unwrap();
        let store = SnapStore::new(&config, Arc::new(DirectoryContainer::new(dir.path())));
        assert_eq!(store.prefix(), "etcd/v2");
        let options = store.upload_options();
        assert_eq!(options.chunk_size, 1024);
        assert_eq!(options.max_parallel, 3);
        assert_eq!(options.max_attempts, 2);
        assert_eq!(options.retry_backoff, Duration::from_millis(50));
        assert_eq!(options.operation_timeout, CHUNK_UPLOAD_TIMEOUT);
    }
}
