//! Capability interface every object-storage backend implements.
//!
//! The snapshot store only ever talks to these traits. A backend is split
//! into a container-scoped client (listing, object client factory) and an
//! object-scoped client (download, delete, block staging and commit).

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;

use crate::error::Result;

/// Readable stream over a stored object. Dropping it closes the stream.
pub type SnapReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Object-scoped client for one blob name.
#[async_trait]
pub trait BlockBlobClient: Send + Sync {
    /// Open a download stream for the committed object.
    async fn download_stream(&self) -> Result<SnapReader>;

    /// Delete the committed object. Fails with `ObjectNotFound` if absent.
    async fn delete(&self) -> Result<()>;

    /// Assemble the object from previously staged blocks, in list order.
    ///
    /// This is the only point at which the object becomes visible. An empty
    /// list commits an empty object.
    async fn commit_block_list(&self, block_ids: &[String]) -> Result<()>;

    /// Stage the bytes of one block. Re-staging an id replaces its bytes.
    async fn stage_block(&self, block_id: &str, data: Bytes) -> Result<()>;
}

/// Lazily fetched listing pages. Each `next_page` call is one round trip.
#[async_trait]
pub trait BlobPager: Send {
    fn more(&self) -> bool;

    /// Names of the objects on the next page.
    async fn next_page(&mut self) -> Result<Vec<String>>;
}

/// Container-scoped client.
pub trait ContainerClient: Send + Sync {
    /// Flat listing of every object whose name starts with `prefix`.
    fn list_blobs_flat(&self, prefix: &str) -> Box<dyn BlobPager>;

    /// Client for the object `blob_name`. Implementations cache clients by
    /// name for the lifetime of the container client.
    fn block_blob_client(&self, blob_name: &str) -> Arc<dyn BlockBlobClient>;
}

/// Block identifier for a 1-based part number.
///
/// Backends assemble blocks by identifier, so the id is the zero-padded
/// decimal part number (order preserving), base64 encoded.
pub fn block_id(part_number: u64) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{:010}", part_number))
}

/// Ordered block list for parts `1..=count`.
pub fn block_list(count: u64) -> Vec<String> {
    (1..=count).map(block_id).collect()
}
