//! Range-parallel chunk download engine.
//!
//! A resource of known size is split into fixed-size chunks (the last absorbs
//! the remainder), downloaded by a bounded worker pool, and written with
//! absolute-offset writes into a preallocated `.part` file. The plan is
//! mirrored to a `.progress` JSON sidecar every 5 seconds so an interrupted
//! download resumes from the last persisted state.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RANGE};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::HttpClient;
use crate::error::DownloadError;
use crate::progress::Progress;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

const WRITE_BUFFER: usize = 128 * 1024;
const SIDECAR_INTERVAL: Duration = Duration::from_secs(5);
const PLAN_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One contiguous byte interval `[start, end]` (inclusive) of the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub downloaded: u64,
    pub completed: bool,
    pub retries: u32,
}

impl Chunk {
    fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            size: end - start + 1,
            downloaded: 0,
            completed: false,
            retries: 0,
        }
    }
}

/// The persisted download plan. Valid for a download only when the total
/// size and URL both match the current request and the timestamp is within
/// seven days.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    pub total_size: u64,
    pub url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ChunkPlan {
    /// Build a fresh plan: `ceil(total_size / chunk_size)` chunks, the last
    /// absorbing the remainder.
    pub fn build(url: impl Into<String>, total_size: u64, chunk_size: u64) -> Self {
        debug_assert!(total_size > 0 && chunk_size > 0);
        let num_chunks = total_size.div_ceil(chunk_size) as usize;
        let mut chunks = Vec::with_capacity(num_chunks);
        for i in 0..num_chunks {
            let start = i as u64 * chunk_size;
            let end = (start + chunk_size - 1).min(total_size - 1);
            chunks.push(Chunk::new(i, start, end));
        }
        Self {
            chunks,
            total_size,
            url: url.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Check every acceptance condition for reusing a persisted plan.
    pub fn validate(&self, url: &str, total_size: u64) -> Result<(), String> {
        if self.chunks.is_empty() {
            return Err("plan has no chunks".to_owned());
        }
        if self.total_size != total_size {
            return Err(format!(
                "total size mismatch: plan {}, request {}",
                self.total_size, total_size
            ));
        }
        if self.url != url {
            return Err("URL mismatch".to_owned());
        }
        let age = OffsetDateTime::now_utc() - self.timestamp;
        if age > PLAN_MAX_AGE {
            return Err("plan is older than 7 days".to_owned());
        }

        let mut expected_start = 0u64;
        let mut sum = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != i {
                return Err(format!("chunk index {} at position {i}", chunk.index));
            }
            if chunk.start != expected_start || chunk.end < chunk.start {
                return Err(format!(
                    "chunk {i} range [{}, {}] breaks the partition",
                    chunk.start, chunk.end
                ));
            }
            if chunk.size != chunk.end - chunk.start + 1 {
                return Err(format!("chunk {i} size disagrees with its range"));
            }
            if chunk.downloaded > chunk.size {
                return Err(format!("chunk {i} downloaded exceeds its size"));
            }
            if chunk.completed && chunk.downloaded != chunk.size {
                return Err(format!("chunk {i} marked completed but not fully downloaded"));
            }
            expected_start = chunk.end + 1;
            sum += chunk.size;
        }
        if expected_start != total_size || sum != total_size {
            return Err(format!("chunks cover {sum} bytes of {total_size}"));
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.completed)
    }

    /// Bytes already on disk according to the plan.
    pub fn bytes_downloaded(&self) -> u64 {
        self.chunks
            .iter()
            .map(|c| if c.completed { c.size } else { c.downloaded })
            .sum()
    }

    pub fn load(path: &Path) -> Result<Self, DownloadError> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| DownloadError::Integrity {
            reason: format!("failed to decode plan sidecar: {e}"),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), DownloadError> {
        let data = serde_json::to_vec_pretty(self).map_err(|e| DownloadError::Internal {
            reason: format!("failed to encode plan sidecar: {e}"),
        })?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

struct EngineShared {
    client: HttpClient,
    url: String,
    headers: HeaderMap,
    plan: RwLock<ChunkPlan>,
    file: File,
    errors: Mutex<Vec<DownloadError>>,
    progress: Arc<Progress>,
    token: CancellationToken,
}

/// Downloads a resource of known size from a range-capable origin into the
/// `.part` file, maintaining the sidecar for resumability.
pub struct RangeChunkEngine {
    client: HttpClient,
    url: String,
    headers: HeaderMap,
    total_size: u64,
    chunk_size: u64,
    threads: usize,
    temp_path: PathBuf,
    sidecar_path: PathBuf,
    progress: Arc<Progress>,
    token: CancellationToken,
}

impl RangeChunkEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: HttpClient,
        url: impl Into<String>,
        headers: HeaderMap,
        total_size: u64,
        chunk_size: u64,
        threads: usize,
        temp_path: impl Into<PathBuf>,
        sidecar_path: impl Into<PathBuf>,
        progress: Arc<Progress>,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            headers,
            total_size,
            chunk_size,
            threads: threads.max(1),
            temp_path: temp_path.into(),
            sidecar_path: sidecar_path.into(),
            progress,
            token,
        }
    }

    pub async fn run(&self) -> Result<(), DownloadError> {
        let plan = self.load_or_build_plan();

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.temp_path)?;
        if file.metadata()?.len() != self.total_size {
            file.set_len(self.total_size)?;
        }

        self.progress.add(plan.bytes_downloaded());

        let pending: Vec<usize> = plan
            .chunks
            .iter()
            .filter(|c| !c.completed)
            .map(|c| c.index)
            .collect();
        info!(
            url = %self.url,
            chunks = plan.chunks.len(),
            pending = pending.len(),
            "starting range-parallel download"
        );

        let shared = Arc::new(EngineShared {
            client: self.client.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            plan: RwLock::new(plan),
            file,
            errors: Mutex::new(Vec::new()),
            progress: self.progress.clone(),
            token: self.token.clone(),
        });

        let (tx, rx) = mpsc::channel(pending.len().max(1));
        for index in pending {
            // Capacity covers every pending chunk; this cannot block.
            tx.send(index).await.ok();
        }
        drop(tx);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let semaphore = Arc::new(Semaphore::new(self.threads));

        let saver_token = CancellationToken::new();
        let saver = tokio::spawn(sidecar_loop(
            shared.clone(),
            self.sidecar_path.clone(),
            saver_token.clone(),
        ));

        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..self.threads {
            let shared = shared.clone();
            let rx = rx.clone();
            let semaphore = semaphore.clone();
            workers.spawn(worker_loop(shared, rx, semaphore));
        }
        while workers.join_next().await.is_some() {}

        saver_token.cancel();
        let _ = saver.await;

        self.finalize(&shared)
    }

    fn load_or_build_plan(&self) -> ChunkPlan {
        if self.sidecar_path.exists() {
            match ChunkPlan::load(&self.sidecar_path) {
                Ok(plan) => match plan.validate(&self.url, self.total_size) {
                    Ok(()) => {
                        info!(
                            chunks = plan.chunks.len(),
                            downloaded = plan.bytes_downloaded(),
                            "resuming from plan sidecar"
                        );
                        return plan;
                    }
                    Err(reason) => warn!(%reason, "discarding invalid plan sidecar"),
                },
                Err(e) => warn!(error = %e, "discarding unreadable plan sidecar"),
            }
        }
        ChunkPlan::build(&self.url, self.total_size, self.chunk_size)
    }

    fn finalize(&self, shared: &EngineShared) -> Result<(), DownloadError> {
        let on_failure = |shared: &EngineShared| {
            // Persist the freshest state so the next run resumes from it.
            let plan = snapshot_plan(shared);
            if let Err(e) = plan.save(&self.sidecar_path) {
                warn!(error = %e, "failed to persist plan sidecar");
            }
        };

        if self.token.is_cancelled() {
            on_failure(shared);
            return Err(DownloadError::Cancelled);
        }
        if let Some(err) = shared.errors.lock().unwrap().drain(..).next() {
            on_failure(shared);
            return Err(err);
        }
        if !shared.plan.read().unwrap().is_complete() {
            on_failure(shared);
            return Err(DownloadError::integrity(
                "not all chunks completed successfully",
            ));
        }

        if let Err(e) = std::fs::remove_file(&self.sidecar_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(error = %e, "failed to remove plan sidecar");
        }
        debug!(url = %self.url, "range-parallel download completed");
        Ok(())
    }
}

fn snapshot_plan(shared: &EngineShared) -> ChunkPlan {
    let mut plan = shared.plan.read().unwrap().clone();
    plan.timestamp = OffsetDateTime::now_utc();
    plan
}

async fn sidecar_loop(shared: Arc<EngineShared>, path: PathBuf, token: CancellationToken) {
    let mut ticker = tokio::time::interval(SIDECAR_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // immediate first tick
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                let plan = snapshot_plan(&shared);
                if let Err(e) = plan.save(&path) {
                    warn!(error = %e, "failed to save plan sidecar");
                }
            }
        }
    }
}

async fn worker_loop(
    shared: Arc<EngineShared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<usize>>>,
    semaphore: Arc<Semaphore>,
) {
    loop {
        let index = { rx.lock().await.recv().await };
        let Some(index) = index else { break };
        if shared.token.is_cancelled() {
            break;
        }
        let Ok(_permit) = semaphore.acquire().await else {
            break;
        };

        if let Err(err) = download_chunk_with_retry(&shared, index).await {
            if matches!(err, DownloadError::Cancelled) {
                break;
            }
            error!(chunk = index, error = %err, "chunk download failed");
            shared.errors.lock().unwrap().push(err);
        }
    }
}

async fn download_chunk_with_retry(
    shared: &Arc<EngineShared>,
    index: usize,
) -> Result<(), DownloadError> {
    let policy = RetryPolicy::chunk();
    retry_with_backoff(&policy, &shared.token, |attempt| async move {
        if attempt > 0 {
            debug!(chunk = index, attempt = attempt + 1, "retrying chunk");
        }
        match download_chunk(shared, index).await {
            Ok(()) => RetryAction::Success(()),
            Err(err) => {
                if !matches!(err, DownloadError::Cancelled) {
                    shared.plan.write().unwrap().chunks[index].retries += 1;
                    warn!(chunk = index, error = %err, "chunk attempt failed");
                }
                RetryAction::from_error(err)
            }
        }
    })
    .await
}

async fn download_chunk(shared: &Arc<EngineShared>, index: usize) -> Result<(), DownloadError> {
    let (range_start, range_end) = {
        let mut plan = shared.plan.write().unwrap();
        let chunk = &mut plan.chunks[index];
        let range_start = chunk.start + chunk.downloaded;
        if range_start > chunk.end {
            chunk.downloaded = chunk.size;
            chunk.completed = true;
            return Ok(());
        }
        (range_start, chunk.end)
    };

    let response = shared
        .client
        .get(&shared.url, &shared.headers)
        .header(RANGE, format!("bytes={range_start}-{range_end}"))
        .send()
        .await?;
    let status = response.status();
    if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
        return Err(DownloadError::http_status(
            status,
            &shared.url,
            "chunk download",
        ));
    }

    // A 200 means the server ignored the range and is sending the full
    // resource: skip up to our offset and take only this chunk's share.
    let mut skip = if status == StatusCode::OK { range_start } else { 0 };
    let mut remaining = range_end - range_start + 1;
    let mut offset = range_start;
    let mut buffer = BytesMut::with_capacity(WRITE_BUFFER);
    let mut stream = response.bytes_stream();

    loop {
        let next = tokio::select! {
            _ = shared.token.cancelled() => return Err(DownloadError::Cancelled),
            next = stream.next() => next,
        };
        let Some(result) = next else { break };
        let mut bytes = result.map_err(DownloadError::from)?;

        if skip > 0 {
            let drop_len = (skip.min(bytes.len() as u64)) as usize;
            let _ = bytes.split_to(drop_len);
            skip -= drop_len as u64;
            if bytes.is_empty() {
                continue;
            }
        }
        if (bytes.len() as u64) > remaining {
            bytes.truncate(remaining as usize);
        }
        remaining -= bytes.len() as u64;
        buffer.extend_from_slice(&bytes);

        while buffer.len() >= WRITE_BUFFER {
            let out = buffer.split_to(WRITE_BUFFER);
            offset = commit(shared, index, offset, &out)?;
        }
        if remaining == 0 {
            break;
        }
    }
    if !buffer.is_empty() {
        let out = buffer.split();
        offset = commit(shared, index, offset, &out)?;
    }
    let _ = offset;

    let mut plan = shared.plan.write().unwrap();
    let chunk = &mut plan.chunks[index];
    chunk.completed = chunk.downloaded >= chunk.size;
    Ok(())
}

/// Write a buffer at its absolute offset, then account it in the plan and
/// the progress tracker. The emitted delta is exactly the bytes written.
fn commit(
    shared: &EngineShared,
    index: usize,
    offset: u64,
    buf: &[u8],
) -> Result<u64, DownloadError> {
    write_all_at(&shared.file, buf, offset)?;
    {
        let mut plan = shared.plan.write().unwrap();
        plan.chunks[index].downloaded += buf.len() as u64;
    }
    shared.progress.add(buf.len() as u64);
    Ok(offset + buf.len() as u64)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, offset)?;
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}
