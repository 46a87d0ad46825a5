//! The dispatcher: applies stream filters, probes server capabilities,
//! chooses an engine per stream, and owns the outer retry loop, the
//! `.part → final` rename, and the transcode handoff.

use std::path::PathBuf;
use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap, RANGE};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk::RangeChunkEngine;
use crate::client::HttpClient;
use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::filter::{filters_for_streams, should_skip};
use crate::hls::{HlsEngine, HlsReader};
use crate::media::{Media, Stream, StreamKind};
use crate::output::{OutputArtifact, resolve_output};
use crate::progress::{Progress, ProgressCallback};
use crate::retry::RetryPolicy;
use crate::single::SingleStreamEngine;
use crate::transcode;
use crate::util;

const COPY_BUFFER: usize = 64 * 1024;

/// What the HEAD probe learned about the origin.
#[derive(Debug, Clone, Copy)]
struct RangeProbe {
    total: Option<u64>,
    supports_range: bool,
}

/// High-level download manager. One instance serves many media items; each
/// stream gets its own engine, progress tracker, and retry budget.
pub struct Downloader {
    config: DownloadConfig,
    http: HttpClient,
    token: CancellationToken,
    progress_callback: Option<ProgressCallback>,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Result<Self, DownloadError> {
        Self::with_cancellation(config, CancellationToken::new())
    }

    pub fn with_cancellation(
        config: DownloadConfig,
        token: CancellationToken,
    ) -> Result<Self, DownloadError> {
        let http = HttpClient::new(&config)?;
        Ok(Self {
            config,
            http,
            token,
            progress_callback: None,
        })
    }

    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress_callback = Some(callback);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download every stream of the media item that survives the filter
    /// chain. With `ignore_errors`, per-stream failures are logged and the
    /// rest continue; cancellation always aborts.
    pub async fn download(&self, media: &Media) -> Result<(), DownloadError> {
        if media.streams.is_empty() {
            return Err(DownloadError::NoStreams {
                title: media.title.clone(),
            });
        }

        let filters = filters_for_streams(&self.config, &media.streams);
        for stream in &media.streams {
            if self.token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if should_skip(stream, &filters) {
                continue;
            }

            debug!(id = %stream.id, kind = ?stream.kind, quality = %stream.quality, "downloading stream");
            match self.download_stream(stream).await {
                Ok(path) => info!(path = %path.display(), "stream finished"),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(e) if self.config.ignore_errors => {
                    error!(id = %stream.id, error = %e, "stream failed, continuing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Download a single stream to its resolved output path and return the
    /// final location (post-transcode when one runs).
    pub async fn download_stream(&self, stream: &Stream) -> Result<PathBuf, DownloadError> {
        let artifact = resolve_output(&self.config, stream);

        if self.config.skip_existing
            && let Ok(meta) = std::fs::metadata(&artifact.final_path)
        {
            let matches = match stream.declared_size() {
                Some(declared) => meta.len() == declared,
                None => meta.len() > 0,
            };
            if matches {
                info!(path = %artifact.final_path.display(), "file already exists, skipping");
                return Ok(artifact.final_path);
            }
        }

        if let Some(dir) = artifact.final_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        self.fetch_with_retry(stream, &artifact).await?;

        tokio::fs::rename(&artifact.temp_path, &artifact.final_path).await?;
        // Normally removed by the chunk engine; covers the case where a
        // range-parallel attempt failed over to the single-stream path.
        if artifact.sidecar_path.exists() {
            let _ = std::fs::remove_file(&artifact.sidecar_path);
        }
        debug!(path = %artifact.final_path.display(), "renamed in-progress file");

        let mut final_path = artifact.final_path.clone();
        if let Some(target) = &self.config.format
            && !target.is_empty()
            && !target.eq_ignore_ascii_case(&stream.format)
        {
            final_path = transcode::convert(&final_path, target).await?;
        }
        Ok(final_path)
    }

    /// The outer retry loop around engine dispatch. Exponential-quadratic
    /// backoff capped at 30 s; a 416 recovers once by dropping the range;
    /// terminal errors and cancellation abort immediately.
    async fn fetch_with_retry(
        &self,
        stream: &Stream,
        artifact: &OutputArtifact,
    ) -> Result<(), DownloadError> {
        let policy = RetryPolicy::stream(self.config.retry_count);
        let mut force_no_range = false;
        let mut failures = 0u32;

        loop {
            if self.token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            match self.fetch_to(stream, artifact, force_no_range).await {
                Ok(()) => return Ok(()),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(DownloadError::RangeNotSatisfiable { url }) if !force_no_range => {
                    warn!(%url, "range rejected with 416, recovering without range");
                    force_no_range = true;
                }
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    failures += 1;
                    if failures > policy.max_retries {
                        return Err(e);
                    }
                    let delay = policy.delay_for_retry(failures);
                    warn!(
                        id = %stream.id,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "stream attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One dispatch attempt: pick the transport path and run it to
    /// completion into the `.part` file.
    async fn fetch_to(
        &self,
        stream: &Stream,
        artifact: &OutputArtifact,
        force_no_range: bool,
    ) -> Result<(), DownloadError> {
        let headers = util::header_map(&stream.headers);
        let description = artifact
            .final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| stream.id.clone());

        if stream.kind == StreamKind::Hls {
            let progress = Arc::new(Progress::with_callback(
                0,
                description,
                self.progress_callback.clone(),
            ));
            let engine = HlsEngine::new(
                self.http.clone(),
                self.config.threads,
                self.config.segment_retry_budget(),
                self.config.quality.clone(),
                self.token.clone(),
            );
            let mut reader = engine.open(&stream.url, &headers).await?;
            let result = self.drain_reader(&mut reader, artifact, &progress).await;
            reader.close().await;
            result?;
            progress.finish();
            return Ok(());
        }

        let probe = self.probe(&stream.url, &headers).await?;
        // Declared sizes are hints; the probe wins when the server answers.
        let total = probe.total.or_else(|| stream.declared_size());

        let range_parallel = !force_no_range
            && probe.supports_range
            && self.config.chunk_size > 0
            && self.config.threads > 1
            && total.is_some_and(|t| t > self.config.chunk_size);

        if range_parallel {
            let total = total.expect("checked by range_parallel");
            let progress = Arc::new(Progress::with_callback(
                total,
                description,
                self.progress_callback.clone(),
            ));
            let engine = RangeChunkEngine::new(
                self.http.clone(),
                &stream.url,
                headers,
                total,
                self.config.chunk_size,
                self.config.threads,
                &artifact.temp_path,
                &artifact.sidecar_path,
                progress.clone(),
                self.token.clone(),
            );
            engine.run().await?;
            progress.finish();
        } else {
            let progress = Arc::new(Progress::with_callback(
                total.unwrap_or(0),
                description,
                self.progress_callback.clone(),
            ));
            let engine = SingleStreamEngine::new(
                self.http.clone(),
                &stream.url,
                headers,
                &artifact.temp_path,
                probe.supports_range,
                self.config.rate_limit,
                progress.clone(),
                self.token.clone(),
            );
            engine.run(force_no_range).await?;
            progress.finish();
        }
        Ok(())
    }

    /// HEAD probe for range support. The probe is advisory: a failed or odd
    /// response downgrades to the single-stream path instead of erroring.
    /// Range support counts only when `Accept-Ranges: bytes` and a positive
    /// `Content-Length` are confirmed by a 206 on a `0-1023` range HEAD.
    async fn probe(&self, url: &str, headers: &HeaderMap) -> Result<RangeProbe, DownloadError> {
        let response = match self.http.head(url, headers).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url, error = %e, "HEAD probe failed, assuming no range support");
                return Ok(RangeProbe {
                    total: None,
                    supports_range: false,
                });
            }
        };
        if !response.status().is_success() {
            debug!(url, status = %response.status(), "HEAD probe not supported");
            return Ok(RangeProbe {
                total: None,
                supports_range: false,
            });
        }

        let advertises_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("bytes"));
        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|t| *t > 0);

        let mut supports_range = false;
        if advertises_ranges && total.is_some() {
            let confirm = self
                .http
                .head(url, headers)
                .header(RANGE, "bytes=0-1023")
                .send()
                .await;
            supports_range =
                matches!(confirm, Ok(r) if r.status() == StatusCode::PARTIAL_CONTENT);
            if !supports_range {
                debug!(url, "range probe not confirmed with 206");
            }
        }

        Ok(RangeProbe {
            total,
            supports_range,
        })
    }

    async fn drain_reader(
        &self,
        reader: &mut HlsReader,
        artifact: &OutputArtifact,
        progress: &Progress,
    ) -> Result<(), DownloadError> {
        let file = tokio::fs::File::create(&artifact.temp_path).await?;
        let mut writer = BufWriter::with_capacity(COPY_BUFFER, file);
        let mut buf = vec![0u8; COPY_BUFFER];

        loop {
            if self.token.is_cancelled() {
                writer.flush().await.ok();
                return Err(DownloadError::Cancelled);
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            progress.add(n as u64);
        }
        writer.flush().await?;
        Ok(())
    }
}
