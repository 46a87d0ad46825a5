//! HLS acquisition: playlist decoding, variant selection, encrypted segment
//! pipeline, and the sequential reader the dispatcher drains into the
//! output file.

pub(crate) mod decryption;
pub(crate) mod playlist;
pub(crate) mod reader;

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, OnceLock};

use reqwest::header::HeaderMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::client::HttpClient;
use crate::error::DownloadError;
use crate::retry::RetryPolicy;

pub use reader::HlsReader;

use decryption::KeyFetcher;
use playlist::LoadedPlaylist;
use reader::ReaderShared;

/// Master playlists can point at further master playlists; bail out before a
/// redirect cycle does.
const MAX_MASTER_HOPS: u32 = 5;

/// Segments above this size stream from a spill file instead of memory.
const SPILL_THRESHOLD: usize = 8 * 1024 * 1024;

pub struct HlsEngine {
    client: HttpClient,
    threads: usize,
    retry_budget: u32,
    quality_hint: String,
    token: CancellationToken,
}

impl HlsEngine {
    pub fn new(
        client: HttpClient,
        threads: usize,
        retry_budget: u32,
        quality_hint: impl Into<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            threads,
            retry_budget,
            quality_hint: quality_hint.into(),
            token,
        }
    }

    /// Resolve the URL down to a media playlist and return a sequential
    /// reader over its (decrypted) segments.
    pub async fn open(&self, url: &str, headers: &HeaderMap) -> Result<HlsReader, DownloadError> {
        let mut playlist_url =
            Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e.to_string()))?;

        let mut hops = 0;
        let media = loop {
            match playlist::fetch_playlist(&self.client, &playlist_url, headers).await? {
                LoadedPlaylist::Media(media) => break media,
                LoadedPlaylist::Master(master) => {
                    hops += 1;
                    if hops > MAX_MASTER_HOPS {
                        return Err(DownloadError::playlist(
                            "master playlist nesting exceeds the hop limit",
                        ));
                    }
                    let variant = playlist::select_variant(&master, &self.quality_hint)?;
                    info!(
                        bandwidth = variant.bandwidth,
                        resolution = ?variant.resolution,
                        "selected variant"
                    );
                    playlist_url = playlist_url.join(&variant.uri).map_err(|e| {
                        DownloadError::playlist(format!(
                            "could not resolve variant URI {}: {e}",
                            variant.uri
                        ))
                    })?;
                }
            }
        };

        if !media.end_list {
            warn!(url = %playlist_url, "playlist is not finalized; downloading the current window");
        }
        let segments = playlist::prepare_segments(&media, &playlist_url, headers)?;
        let segment_count = segments.len();

        let workers = match self.threads.min(segment_count) {
            0 => 4.min(segment_count),
            n => n,
        };
        let prefetch_window = (workers * 2).min(10);
        info!(
            url = %playlist_url,
            segments = segment_count,
            workers,
            prefetch_window,
            "prepared HLS media playlist"
        );

        let reader_token = self.token.child_token();
        let shared = Arc::new(ReaderShared {
            client: self.client.clone(),
            cache: (0..segment_count).map(|_| OnceLock::new()).collect(),
            segments,
            in_flight: Mutex::new(HashSet::new()),
            fetch_permits: Semaphore::new(workers),
            policy: RetryPolicy::segment(self.retry_budget),
            key_fetcher: KeyFetcher::new(
                self.client.clone(),
                RetryPolicy::segment(self.retry_budget),
                reader_token.clone(),
            ),
            prefetch_window,
            spill_threshold: SPILL_THRESHOLD,
            token: reader_token,
            closed: AtomicBool::new(false),
        });

        reader::spawn_prefetch(&shared, 0);
        Ok(HlsReader::new(shared))
    }
}
