//! Local directory backend.
//!
//! Treats a filesystem directory as a container. Blocks are staged under
//! `.staging/<blob>/` and a commit concatenates them in list order into a
//! temp file which is fsynced and renamed over the blob (atomic publish).

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use snapstore_common::backend::{BlobPager, BlockBlobClient, ContainerClient, SnapReader};
use snapstore_common::{Result, SnapstoreError};

const STAGING_DIR: &str = ".staging";

pub struct DirectoryContainer {
    base_path: PathBuf,
    clients: Mutex<HashMap<String, Arc<DirectoryBlob>>>,
}

impl DirectoryContainer {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl ContainerClient for DirectoryContainer {
    fn list_blobs_flat(&self, prefix: &str) -> Box<dyn BlobPager> {
        Box::new(DirectoryPager {
            base_path: self.base_path.clone(),
            prefix: prefix.to_string(),
            done: false,
        })
    }

    fn block_blob_client(&self, blob_name: &str) -> Arc<dyn BlockBlobClient> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let client = clients
            .entry(blob_name.to_string())
            .or_insert_with(|| Arc::new(DirectoryBlob::new(&self.base_path, blob_name)))
            .clone();
        client
    }
}

/// A directory listing is a single page.
struct DirectoryPager {
    base_path: PathBuf,
    prefix: String,
    done: bool,
}

#[async_trait]
impl BlobPager for DirectoryPager {
    fn more(&self) -> bool {
        !self.done
    }

    async fn next_page(&mut self) -> Result<Vec<String>> {
        self.done = true;
        let mut keys = Vec::new();
        if !self.base_path.exists() {
            return Ok(keys);
        }

        let mut stack = vec![self.base_path.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;

                if meta.is_dir() {
                    if dir == self.base_path && entry.file_name() == STAGING_DIR {
                        continue;
                    }
                    stack.push(path);
                } else if meta.is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.base_path) {
                        let key = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/");
                        if key.starts_with(&self.prefix) {
                            keys.push(key);
                        }
                    }
                }
            }
        }

        keys.sort();
        debug!(prefix = %self.prefix, count = keys.len(), "Directory listing complete");
        Ok(keys)
    }
}

pub struct DirectoryBlob {
    name: String,
    path: PathBuf,
    staging_path: PathBuf,
}

impl DirectoryBlob {
    fn new(base_path: &Path, name: &str) -> Self {
        // Prevent path traversal
        let key = name.replace("..", "");
        let key = key.trim_start_matches('/');
        Self {
            name: name.to_string(),
            path: base_path.join(key),
            staging_path: base_path.join(STAGING_DIR).join(key),
        }
    }

    fn block_path(&self, block_id: &str) -> PathBuf {
        // Block ids are base64 and may contain '/'.
        self.staging_path.join(hex::encode(block_id))
    }

    fn not_found(&self, e: std::io::Error) -> SnapstoreError {
        if e.kind() == ErrorKind::NotFound {
            SnapstoreError::ObjectNotFound(self.name.clone())
        } else {
            e.into()
        }
    }
}

#[async_trait]
impl BlockBlobClient for DirectoryBlob {
    async fn download_stream(&self) -> Result<SnapReader> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| self.not_found(e))?;
        Ok(Box::new(file))
    }

    async fn delete(&self) -> Result<()> {
        tokio::fs::remove_file(&self.path)
            .await
            .map_err(|e| self.not_found(e))?;
        debug!(blob = %self.name, "Directory delete complete");
        Ok(())
    }

    async fn commit_block_list(&self, block_ids: &[String]) -> Result<()> {
        tokio::fs::create_dir_all(&self.staging_path).await?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.staging_path.join(".commit");
        let mut out = tokio::fs::File::create(&tmp_path).await?;
        for id in block_ids {
            let block = match tokio::fs::read(self.block_path(id)).await {
                Ok(block) => block,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    drop(out);
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(SnapstoreError::Io(std::io::Error::new(
                        ErrorKind::NotFound,
                        format!("block {} was never staged for {}", id, self.name),
                    )));
                }
                Err(e) => return Err(e.into()),
            };
            out.write_all(&block).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        tokio::fs::remove_dir_all(&self.staging_path).await?;

        debug!(blob = %self.name, blocks = block_ids.len(), "Directory commit complete");
        Ok(())
    }

    async fn stage_block(&self, block_id: &str, data: Bytes) -> Result<()> {
        tokio::fs::create_dir_all(&self.staging_path).await?;
        let dest = self.block_path(block_id);
        let tmp_path = dest.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &dest).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapstore_common::backend::{block_id, block_list};
    use tokio::io::AsyncReadExt;

    async fn read_all(client: &Arc<dyn BlockBlobClient>) -> Vec<u8> {
        let mut reader = client.download_stream().await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_stage_commit_download() {
        let dir = tempfile::tempdir().unwrap();
        let container = DirectoryContainer::new(dir.path());
        let client = container.block_blob_client("etcd/v2/Full-00000000-00000010-1700000000");

        // Staged out of order; the commit list decides the layout.
        client.stage_block(&block_id(2), Bytes::from("world")).await.unwrap();
        client.stage_block(&block_id(1), Bytes::from("hello ")).await.unwrap();
        assert!(matches!(
            client.download_stream().await,
            Err(SnapstoreError::ObjectNotFound(_))
        ));

        client.commit_block_list(&block_list(2)).await.unwrap();
        assert_eq!(read_all(&client).await, b"hello world");
        assert!(!dir.path().join(STAGING_DIR).join("etcd/v2/Full-00000000-00000010-1700000000").exists());
    }

    #[tokio::test]
    async fn test_restage_overwrites_block() {
        let dir = tempfile::tempdir().unwrap();
        let container = DirectoryContainer::new(dir.path());
        let client = container.block_blob_client("a/v2/blob");

        client.stage_block(&block_id(1), Bytes::from("first")).await.unwrap();
        client.stage_block(&block_id(1), Bytes::from("second")).await.unwrap();
        client.commit_block_list(&block_list(1)).await.unwrap();
        assert_eq!(read_all(&client).await, b"second");
    }

    #[tokio::test]
    async fn test_commit_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let container = DirectoryContainer::new(dir.path());
        let client = container.block_blob_client("a/v2/empty");
        client.commit_block_list(&[]).await.unwrap();
        assert!(read_all(&client).await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_missing_block_fails() {
        let dir = tempfile::tempdir().unwrap();
        let container = DirectoryContainer::new(dir.path());
        let client = container.block_blob_client("a/v2/partial");
        client.stage_block(&block_id(1), Bytes::from("x")).await.unwrap();

        assert!(client.commit_block_list(&block_list(2)).await.is_err());
        assert!(!dir.path().join("a/v2/partial").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let container = DirectoryContainer::new(dir.path());
        let err = container
            .block_blob_client("a/v2/missing")
            .delete()
            .await
            .unwrap_err();
        assert!(matches!(err, SnapstoreError::ObjectNotFound(ref name) if name == "a/v2/missing"));
    }

    #[tokio::test]
    async fn test_listing_skips_staging_and_filters_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let container = DirectoryContainer::new(dir.path());

        for name in ["etcd/v1/Backup-1/one", "etcd/v2/two", "other/v2/three"] {
            let client = container.block_blob_client(name);
            client.stage_block(&block_id(1), Bytes::from("x")).await.unwrap();
            client.commit_block_list(&block_list(1)).await.unwrap();
        }
        container
            .block_blob_client("etcd/v2/pending")
            .stage_block(&block_id(1), Bytes::from("x"))
            .await
            .unwrap();

        let mut pager = container.list_blobs_flat("etcd/");
        assert!(pager.more());
        let keys = pager.next_page().await.unwrap();
        assert!(!pager.more());
        assert_eq!(keys, vec!["etcd/v1/Backup-1/one", "etcd/v2/two"]);
    }

    #[tokio::test]
    async fn test_client_cache() {
        let dir = tempfile::tempdir().unwrap();
        let container = DirectoryContainer::new(dir.path());
        let a = container.block_blob_client("a/v2/x");
        let b = container.block_blob_client("a/v2/x");
        let c = container.block_blob_client("a/v2/y");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let container = DirectoryContainer::new(dir.path());
        let client = container.block_blob_client("../../etc/v2/passwd");
        client.stage_block(&block_id(1), Bytes::from("x")).await.unwrap();
        client.commit_block_list(&block_list(1)).await.unwrap();
        assert!(dir.path().join("etc/v2/passwd").exists());
    }
}
