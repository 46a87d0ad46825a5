use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::HeaderMap;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Configurable options for the downloader.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Directory downloaded files are written to.
    pub output_path: PathBuf,

    /// Explicit output filename. Overrides the title-derived name; an
    /// extension is appended from the stream format when missing.
    pub output_name: Option<String>,

    /// Preferred quality: `best` (default), `worst`, or a literal label.
    pub quality: String,

    /// Target container format. When it differs from the stream's format the
    /// finished file is handed to the external transcoder.
    pub format: Option<String>,

    /// Netscape cookies.txt file to load into the client's cookie jar.
    pub cookie_file: Option<PathBuf>,

    /// Extra default headers applied to every request.
    pub headers: HeaderMap,

    /// User agent string.
    pub user_agent: String,

    /// Proxy URL (e.g. `http://127.0.0.1:8080`).
    pub proxy: Option<String>,

    /// Retry attempts per stream.
    pub retry_count: u32,

    /// Overall timeout for each HTTP request.
    pub timeout: Duration,

    /// Number of concurrent download workers.
    pub threads: usize,

    /// Chunk size in bytes for range-parallel downloads.
    pub chunk_size: u64,

    /// Read rate limit in bytes per second for the single-stream path.
    /// 0 disables pacing.
    pub rate_limit: u64,

    /// Skip the download when the final file already exists with the
    /// declared size.
    pub skip_existing: bool,

    /// Playlist window bounds (inclusive, open when unset).
    pub playlist_start: Option<u32>,
    pub playlist_end: Option<u32>,

    /// Keep subtitle streams.
    pub subtitle: bool,

    /// Keep only audio streams.
    pub audio_only: bool,

    /// Keep only video (and HLS) streams.
    pub video_only: bool,

    /// Continue with the remaining streams when one fails.
    pub ignore_errors: bool,

    /// Disable the disk-backed response cache.
    pub no_cache: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("."),
            output_name: None,
            quality: "best".to_owned(),
            format: None,
            cookie_file: None,
            headers: HeaderMap::new(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            proxy: None,
            retry_count: 3,
            timeout: Duration::from_secs(30),
            threads: 4,
            chunk_size: 1024 * 1024,
            rate_limit: 0,
            skip_existing: false,
            playlist_start: None,
            playlist_end: None,
            subtitle: false,
            audio_only: false,
            video_only: false,
            ignore_errors: false,
            no_cache: false,
        }
    }
}

impl DownloadConfig {
    /// Retry budget for HLS segments and keys.
    pub(crate) fn segment_retry_budget(&self) -> u32 {
        self.retry_count.max(3)
    }
}
