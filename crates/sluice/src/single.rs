//! Single-connection download engine with opportunistic resume.
//!
//! Used when range parallelism is unavailable or not worth it: one GET,
//! optionally ranged from the bytes already in the `.part` file, streamed
//! through a buffered writer with cancellation observed on every iteration.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, HeaderMap, RANGE};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::HttpClient;
use crate::error::DownloadError;
use crate::progress::Progress;
use crate::util::RatePacer;

const WRITE_BUFFER: usize = 32 * 1024;

pub struct SingleStreamEngine {
    client: HttpClient,
    url: String,
    headers: HeaderMap,
    temp_path: PathBuf,
    supports_range: bool,
    rate_limit: u64,
    progress: Arc<Progress>,
    token: CancellationToken,
}

impl SingleStreamEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: HttpClient,
        url: impl Into<String>,
        headers: HeaderMap,
        temp_path: impl Into<PathBuf>,
        supports_range: bool,
        rate_limit: u64,
        progress: Arc<Progress>,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            headers,
            temp_path: temp_path.into(),
            supports_range,
            rate_limit,
            progress,
            token,
        }
    }

    pub async fn run(&self, force_no_range: bool) -> Result<(), DownloadError> {
        let use_range = self.supports_range && !force_no_range;
        let resume_offset = if use_range {
            std::fs::metadata(&self.temp_path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let mut request = self.client.get(&self.url, &self.headers);
        if resume_offset > 0 {
            request = request.header(RANGE, format!("bytes={resume_offset}-"));
        }
        let response = request.send().await?;
        let status = response.status();

        let (mut offset, truncate) = if status == StatusCode::OK {
            // The server ignored the range: full re-download from zero.
            if resume_offset > 0 {
                debug!(url = %self.url, "server returned 200 on resume, restarting");
            }
            (0u64, true)
        } else if status == StatusCode::PARTIAL_CONTENT {
            (resume_offset, false)
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            if let Some(total) = total
                && resume_offset >= total
            {
                info!(url = %self.url, "already fully downloaded");
                self.progress.set_total(total);
                self.progress.add(total);
                return Ok(());
            }
            warn!(url = %self.url, resume_offset, "range rejected, restarting without range");
            return Box::pin(self.run(true)).await;
        } else {
            return Err(DownloadError::http_status(status, &self.url, "download"));
        };

        if let Some(len) = response.content_length() {
            self.progress.set_total(len + offset);
        }
        self.progress.add(offset);

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(!truncate && offset > 0)
            .truncate(truncate || offset == 0)
            .open(&self.temp_path)
            .await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);
        let mut pacer = RatePacer::new(self.rate_limit);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => {
                    // Flush what arrived so a later run resumes from it.
                    writer.flush().await.ok();
                    return Err(DownloadError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(result) = next else { break };
            let bytes = result.map_err(DownloadError::from)?;
            writer.write_all(&bytes).await?;
            offset += bytes.len() as u64;
            self.progress.add(bytes.len() as u64);
            pacer.pace(bytes.len()).await;
        }
        writer.flush().await?;

        debug!(url = %self.url, bytes = offset, "single-stream download completed");
        Ok(())
    }
}

/// Total from a `Content-Range` value such as `bytes */1234` or
/// `bytes 0-5/1234`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_parsing() {
        assert_eq!(parse_content_range_total("bytes */4096"), Some(4096));
        assert_eq!(parse_content_range_total("bytes 0-1023/4096"), Some(4096));
        assert_eq!(parse_content_range_total("bytes */*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }
}
