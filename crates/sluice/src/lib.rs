//! Resilient, resumable, multi-source media download engine.
//!
//! Given an already-resolved media item (a set of candidate streams), the
//! engine selects streams, negotiates the transport (plain HTTP with
//! optional byte-range parallelism, or an HLS playlist of encrypted
//! segments), writes bytes to disk with crash-safe resume, reports progress,
//! and converges on a canonical output file.

pub mod cache;
pub mod chunk;
pub mod client;
pub mod config;
pub mod cookies;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod hls;
pub mod media;
pub mod output;
pub mod progress;
pub mod retry;
pub mod single;
pub mod transcode;
pub mod util;

pub use config::{DEFAULT_USER_AGENT, DownloadConfig};
pub use dispatch::Downloader;
pub use error::DownloadError;
pub use media::{Media, Stream, StreamKind};
pub use progress::{Progress, ProgressCallback};

pub use tokio_util::sync::CancellationToken;
