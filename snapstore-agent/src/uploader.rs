//! Chunked upload engine.
//!
//! Splits a staged snapshot file into fixed-size chunks and stages them with
//! a bounded pool of worker tasks sharing one work queue. The first chunk that
//! exhausts its attempts cancels the pool; the object is committed only when
//! every chunk was staged. Block order is recovered from block ids at commit
//! time, never from completion order.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use snapstore_common::backend::{block_id, block_list, BlockBlobClient};
use snapstore_common::{Result, SnapstoreError};

pub const CHUNK_UPLOAD_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: u64,
    pub max_parallel: usize,
    /// Attempts per chunk, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub retry_backoff: Duration,
    /// Deadline for each stage and commit call.
    pub operation_timeout: Duration,
}

/// One contiguous byte range of the staged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub size: u64,
    /// 1-based part number, mapped to the block id.
    pub id: u64,
    /// 1-based attempt number.
    pub attempt: u32,
}

#[derive(Debug)]
pub struct ChunkUploadResult {
    pub chunk: Chunk,
    pub error: Option<SnapstoreError>,
}

pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    if size == 0 || chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size)
}

pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<Chunk> {
    (0..chunk_count(size, chunk_size))
        .map(|index| {
            let offset = index * chunk_size;
            Chunk {
                offset,
                size: chunk_size.min(size - offset),
                id: index + 1,
                attempt: 1,
            }
        })
        .collect()
}

/// Run `fut` under its own deadline.
pub(crate) async fn with_deadline<T>(
    operation: impl Into<String>,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SnapstoreError::Timeout {
            operation: operation.into(),
            timeout,
        }),
    }
}

/// Upload the first `size` bytes of `path` to `blob` and commit them.
///
/// A zero-sized file commits an empty block list without staging anything.
pub async fn upload_file(
    path: &Path,
    size: u64,
    blob: Arc<dyn BlockBlobClient>,
    options: &UploadOptions,
) -> Result<()> {
    if options.chunk_size == 0 || options.max_parallel == 0 || options.max_attempts == 0 {
        return Err(SnapstoreError::Configuration(format!(
            "invalid upload options: chunk_size {}, max_parallel {}, max_attempts {}",
            options.chunk_size, options.max_parallel, options.max_attempts
        )));
    }

    let chunks = plan_chunks(size, options.chunk_size);
    let count = chunks.len() as u64;
    info!(size, chunk_size = options.chunk_size, chunks = count, "Uploading snapshot");

    if count > 0 {
        stage_chunks(path, chunks, blob.clone(), options).await?;
        info!("All chunks uploaded successfully. Uploading block list.");
    }

    let block_ids = block_list(count);
    with_deadline(
        format!("commit block list of {} blocks", count),
        options.operation_timeout,
        blob.commit_block_list(&block_ids),
    )
    .await
    .map_err(|e| e.context("upload block list for snapshot"))?;

    info!(blocks = count, "Block list uploaded successfully");
    Ok(())
}

async fn stage_chunks(
    path: &Path,
    chunks: Vec<Chunk>,
    blob: Arc<dyn BlockBlobClient>,
    options: &UploadOptions,
) -> Result<()> {
    let count = chunks.len();
    let (work_tx, work_rx) = mpsc::channel::<Chunk>(count);
    let (result_tx, mut result_rx) = mpsc::channel::<ChunkUploadResult>(count);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let cancel = CancellationToken::new();

    let mut workers = JoinSet::new();
    for worker in 0..options.max_parallel.clamp(1, count) {
        workers.spawn(chunk_worker(
            worker,
            path.to_path_buf(),
            blob.clone(),
            work_rx.clone(),
            result_tx.clone(),
            cancel.clone(),
            options.operation_timeout,
        ));
    }
    drop(result_tx);

    for chunk in chunks {
        // Capacity equals the chunk count, so this never waits.
        if work_tx.send(chunk).await.is_err() {
            break;
        }
    }
    debug!(total = count, "Triggered chunk upload for all chunks");

    let outcome = collect_chunk_results(
        &mut result_rx,
        &mut workers,
        &work_tx,
        &cancel,
        count,
        options,
    )
    .await;

    // Stop idle workers, then drain results of chunks that were in flight.
    cancel.cancel();
    drop(work_tx);
    while let Some(late) = result_rx.recv().await {
        debug!(
            id = late.chunk.id,
            failed = late.error.is_some(),
            "Drained in-flight chunk result"
        );
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Chunk upload worker panicked");
        }
    }

    outcome
}

/// Wait for every chunk to succeed, re-queueing failures while they have
/// attempts left. Returns the first chunk failure that is out of attempts,
/// or a worker failure if a worker dies with chunks outstanding.
async fn collect_chunk_results(
    result_rx: &mut mpsc::Receiver<ChunkUploadResult>,
    workers: &mut JoinSet<()>,
    work_tx: &mpsc::Sender<Chunk>,
    cancel: &CancellationToken,
    count: usize,
    options: &UploadOptions,
) -> Result<()> {
    let mut remaining = count;

    loop {
        let result = tokio::select! {
            biased;
            result = result_rx.recv() => result,
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                match joined {
                    // Workers only return once cancelled or the result channel closes.
                    Ok(()) => continue,
                    Err(e) => {
                        error!(error = %e, remaining, "Chunk upload worker died, stopping all workers");
                        cancel.cancel();
                        return Err(SnapstoreError::UploadWorker(format!(
                            "{} with {} of {} chunks outstanding",
                            e, remaining, count
                        )));
                    }
                }
            }
        };
        let Some(result) = result else {
            break;
        };

        let chunk = result.chunk;
        match result.error {
            None => {
                remaining -= 1;
                debug!(id = chunk.id, offset = chunk.offset, remaining, "Chunk uploaded");
                if remaining == 0 {
                    debug!("Received successful chunk result for all chunks");
                    return Ok(());
                }
            }
            Some(err) if chunk.attempt >= options.max_attempts => {
                error!(
                    id = chunk.id,
                    offset = chunk.offset,
                    attempt = chunk.attempt,
                    error = %err,
                    "Chunk upload failed on its last attempt, stopping all workers"
                );
                cancel.cancel();
                return Err(SnapstoreError::ChunkUpload {
                    id: chunk.id,
                    offset: chunk.offset,
                    attempt: chunk.attempt,
                    source: Box::new(err),
                });
            }
            Some(err) => {
                let delay = options
                    .retry_backoff
                    .saturating_mul(2u32.saturating_pow(chunk.attempt - 1));
                let retry = Chunk {
                    attempt: chunk.attempt + 1,
                    ..chunk
                };
                warn!(
                    id = chunk.id,
                    offset = chunk.offset,
                    next_attempt = retry.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Chunk upload failed, will retry"
                );

                let work_tx = work_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = work_tx.send(retry).await;
                        }
                    }
                });
            }
        }
    }

    Err(SnapstoreError::UploadWorker(format!(
        "all workers exited with {} of {} chunks outstanding",
        remaining, count
    )))
}

async fn chunk_worker(
    worker: usize,
    path: PathBuf,
    blob: Arc<dyn BlockBlobClient>,
    work_rx: Arc<Mutex<mpsc::Receiver<Chunk>>>,
    result_tx: mpsc::Sender<ChunkUploadResult>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            chunk = async { work_rx.lock().await.recv().await } => chunk,
        };
        let Some(chunk) = next else {
            break;
        };

        debug!(
            worker,
            id = chunk.id,
            offset = chunk.offset,
            attempt = chunk.attempt,
            "Uploading chunk"
        );
        let error = upload_chunk(&path, &chunk, blob.as_ref(), timeout).await.err();
        if result_tx.send(ChunkUploadResult { chunk, error }).await.is_err() {
            break;
        }
    }
}

async fn upload_chunk(
    path: &Path,
    chunk: &Chunk,
    blob: &dyn BlockBlobClient,
    timeout: Duration,
) -> Result<()> {
    let data = read_chunk(path, chunk).await?;
    with_deadline(
        format!("stage block {} at offset {}", chunk.id, chunk.offset),
        timeout,
        blob.stage_block(&block_id(chunk.id), data),
    )
    .await
}

async fn read_chunk(path: &Path, chunk: &Chunk) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(chunk.offset)).await?;
    let mut buf = vec![0u8; chunk.size as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
