//! Sequential segment reader with bounded, best-effort prefetch.
//!
//! The reader walks segments in playlist order. Prefetch tasks fill
//! per-segment cache slots ahead of the cursor; they are tied to the
//! reader's cancellation token and never write after close. Oversized
//! segments spill to a temp directory instead of staying resident.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::HttpClient;
use crate::error::{DownloadError, is_retryable_status};
use crate::hls::decryption::{self, KeyFetcher};
use crate::hls::playlist::SegmentInfo;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

pub(crate) struct ReaderShared {
    pub client: HttpClient,
    pub segments: Vec<SegmentInfo>,
    pub cache: Vec<OnceLock<Bytes>>,
    pub in_flight: Mutex<HashSet<usize>>,
    pub fetch_permits: Semaphore,
    pub policy: RetryPolicy,
    pub key_fetcher: KeyFetcher,
    pub prefetch_window: usize,
    pub spill_threshold: usize,
    pub token: CancellationToken,
    pub closed: AtomicBool,
}

enum SegmentCursor {
    Mem { data: Bytes, pos: usize },
    Spilled { file: tokio::fs::File },
}

/// The sequential byte reader returned by the HLS engine. Its concatenated
/// output is the media payload in playlist order.
pub struct HlsReader {
    shared: Arc<ReaderShared>,
    current_idx: usize,
    current: Option<SegmentCursor>,
    spill_dir: Option<tempfile::TempDir>,
}

impl HlsReader {
    pub(crate) fn new(shared: Arc<ReaderShared>) -> Self {
        Self {
            shared,
            current_idx: 0,
            current: None,
            spill_dir: None,
        }
    }

    /// Read the next bytes of the payload. Short reads are returned as-is;
    /// 0 means end of stream (or a closed reader).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, DownloadError> {
        if buf.is_empty() || self.shared.closed.load(Ordering::Acquire) {
            return Ok(0);
        }

        loop {
            if let Some(cursor) = &mut self.current {
                let n = match cursor {
                    SegmentCursor::Mem { data, pos } => {
                        let n = (data.len() - *pos).min(buf.len());
                        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                        *pos += n;
                        n
                    }
                    SegmentCursor::Spilled { file } => file.read(buf).await?,
                };
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }

            if self.current_idx >= self.shared.segments.len() {
                return Ok(0);
            }
            let index = self.current_idx;
            self.current_idx += 1;

            let data = match self.shared.cache[index].get() {
                Some(cached) => cached.clone(),
                None => fetch_segment(&self.shared, index).await?,
            };
            self.current = Some(self.open_cursor(index, data).await?);
            spawn_prefetch(&self.shared, self.current_idx);
        }
    }

    async fn open_cursor(&mut self, index: usize, data: Bytes) -> Result<SegmentCursor, DownloadError> {
        if data.len() <= self.shared.spill_threshold {
            return Ok(SegmentCursor::Mem { data, pos: 0 });
        }

        if self.spill_dir.is_none() {
            self.spill_dir = Some(
                tempfile::Builder::new()
                    .prefix("sluice-hls-")
                    .tempdir()
                    .map_err(DownloadError::from)?,
            );
        }
        let dir = self.spill_dir.as_ref().expect("spill dir just created");
        let path = dir.path().join(format!("segment_{index}.ts"));
        tokio::fs::write(&path, &data).await?;
        let file = tokio::fs::File::open(&path).await?;
        debug!(segment = index, bytes = data.len(), "spilled oversized segment");
        Ok(SegmentCursor::Spilled { file })
    }

    /// Shut the reader down: cancel prefetch, drop the current segment, and
    /// remove the spill workspace. Idempotent; reads afterwards return EOF.
    pub async fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.token.cancel();
        self.current = None;
        if let Some(dir) = self.spill_dir.take()
            && let Err(e) = dir.close()
        {
            warn!(error = %e, "failed to remove HLS spill directory");
        }
    }
}

impl Drop for HlsReader {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.token.cancel();
    }
}

/// Launch best-effort prefetch tasks for the forward window starting at
/// `from`, skipping segments already cached or in flight. No task outlives
/// the reader's token, and none writes after close.
pub(crate) fn spawn_prefetch(shared: &Arc<ReaderShared>, from: usize) {
    if shared.closed.load(Ordering::Acquire) || shared.token.is_cancelled() {
        return;
    }
    let end = (from + shared.prefetch_window).min(shared.segments.len());
    for index in from..end {
        if shared.cache[index].get().is_some() {
            continue;
        }
        if !shared.in_flight.lock().unwrap().insert(index) {
            continue;
        }

        let shared = shared.clone();
        tokio::spawn(async move {
            prefetch_one(&shared, index).await;
            shared.in_flight.lock().unwrap().remove(&index);
        });
    }
}

async fn prefetch_one(shared: &Arc<ReaderShared>, index: usize) {
    let permit = tokio::select! {
        _ = shared.token.cancelled() => return,
        permit = shared.fetch_permits.acquire() => permit,
    };
    let Ok(_permit) = permit else { return };
    if shared.closed.load(Ordering::Acquire) {
        return;
    }

    match fetch_segment(shared, index).await {
        Ok(bytes) => {
            if !shared.closed.load(Ordering::Acquire) {
                let _ = shared.cache[index].set(bytes);
            }
        }
        Err(DownloadError::Cancelled) => {}
        Err(e) => debug!(segment = index, error = %e, "prefetch failed, reader will retry"),
    }
}

/// Fetch and (when encrypted) decrypt one segment, retrying per the policy.
pub(crate) async fn fetch_segment(
    shared: &Arc<ReaderShared>,
    index: usize,
) -> Result<Bytes, DownloadError> {
    let segment = &shared.segments[index];
    retry_with_backoff(&shared.policy, &shared.token, |_| async move {
        match fetch_once(shared, index).await {
            Ok(bytes) => RetryAction::Success(bytes),
            Err(err) => {
                if !matches!(err, DownloadError::Cancelled) {
                    segment.retries.fetch_add(1, Ordering::Relaxed);
                }
                RetryAction::from_error(err)
            }
        }
    })
    .await
}

async fn fetch_once(shared: &Arc<ReaderShared>, index: usize) -> Result<Bytes, DownloadError> {
    let segment = &shared.segments[index];

    let response = tokio::select! {
        _ = shared.token.cancelled() => return Err(DownloadError::Cancelled),
        response = shared
            .client
            .get(segment.uri.as_str(), &segment.headers)
            .send() => response?,
    };
    let status = response.status();
    if status != StatusCode::OK {
        return Err(DownloadError::SegmentFetch {
            reason: format!("HTTP {status} for segment {}", segment.uri),
            retryable: is_retryable_status(status),
        });
    }
    let body = tokio::select! {
        _ = shared.token.cancelled() => return Err(DownloadError::Cancelled),
        body = response.bytes() => body?,
    };

    let Some(key) = &segment.key else {
        return Ok(body);
    };
    let key_bytes = shared.key_fetcher.fetch_key(&key.uri).await?;
    let iv = match &key.iv {
        Some(iv) => decryption::parse_iv(iv)?,
        None => decryption::iv_from_sequence(segment.sequence),
    };
    let plaintext = decryption::decrypt_segment(body.to_vec(), &key_bytes, &iv)?;
    Ok(Bytes::from(plaintext))
}
