use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "sluice",
    version,
    about = "Download media over HTTP and HLS with resumable, parallel transfers"
)]
pub struct Args {
    /// URL to download, or a path to a JSON media manifest produced by an
    /// extractor.
    pub input: String,

    /// Directory to save downloaded files into.
    #[arg(short = 'o', long, default_value = ".")]
    pub output_path: PathBuf,

    /// Explicit output filename (extension completed from the stream format).
    #[arg(short = 'O', long)]
    pub output_name: Option<String>,

    /// Preferred quality: best, worst, or a literal label such as 1080p.
    #[arg(short, long, default_value = "best")]
    pub quality: String,

    /// Convert the finished file to this container format (requires ffmpeg).
    #[arg(short, long)]
    pub format: Option<String>,

    /// Netscape cookies.txt file.
    #[arg(long)]
    pub cookies: Option<PathBuf>,

    /// Extra request header, NAME:VALUE. May be repeated.
    #[arg(short = 'H', long = "header", value_name = "NAME:VALUE")]
    pub headers: Vec<String>,

    /// Override the User-Agent string.
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Proxy URL, e.g. http://127.0.0.1:8080.
    #[arg(short = 'x', long)]
    pub proxy: Option<String>,

    /// Retry attempts per stream.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Concurrent download workers.
    #[arg(short = 'n', long, default_value_t = 4)]
    pub threads: usize,

    /// Chunk size in bytes for range-parallel downloads.
    #[arg(long, default_value_t = 1024 * 1024)]
    pub chunk_size: u64,

    /// Limit download speed in bytes per second (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub rate_limit: u64,

    /// Skip streams whose output file already exists.
    #[arg(long)]
    pub skip_existing: bool,

    /// First playlist entry to download (inclusive).
    #[arg(long)]
    pub playlist_start: Option<u32>,

    /// Last playlist entry to download (inclusive).
    #[arg(long)]
    pub playlist_end: Option<u32>,

    /// Keep subtitle streams.
    #[arg(long)]
    pub subtitle: bool,

    /// Download audio streams only.
    #[arg(long)]
    pub audio_only: bool,

    /// Download video streams only.
    #[arg(long)]
    pub video_only: bool,

    /// Continue with remaining streams when one fails.
    #[arg(long)]
    pub ignore_errors: bool,

    /// Disable the disk response cache.
    #[arg(long)]
    pub no_cache: bool,

    /// Print media information without downloading.
    #[arg(long)]
    pub info: bool,

    /// Verbose (debug) logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Errors only.
    #[arg(long)]
    pub quiet: bool,
}
