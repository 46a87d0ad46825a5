//! Playlist fetching, classification, variant selection, and segment
//! preparation.

use std::time::Duration;

use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, VariantStream, parse_playlist_res};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheKey, CacheResourceType};
use crate::client::HttpClient;
use crate::error::DownloadError;

const PLAYLIST_TTL: Duration = Duration::from_secs(60);

pub(crate) enum LoadedPlaylist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

/// Effective encryption for a segment. Built only for `AES-128`;
/// `METHOD=NONE` clears encryption, any other method makes the stream
/// non-decryptable.
#[derive(Debug, Clone)]
pub(crate) struct KeyDescriptor {
    pub uri: Url,
    /// Hex IV as written in the playlist (optional `0x` prefix). When
    /// absent, the IV derives from the segment media sequence number.
    pub iv: Option<String>,
}

#[derive(Debug)]
pub(crate) struct SegmentInfo {
    pub uri: Url,
    #[allow(dead_code)]
    pub duration: f32,
    pub key: Option<KeyDescriptor>,
    /// Media sequence number: playlist base plus position.
    pub sequence: u64,
    pub headers: HeaderMap,
    pub retries: std::sync::atomic::AtomicU32,
}

/// GET and decode a playlist. Per-stream headers are merged in; the body is
/// surfaced raw to the parser, and any non-200 fails.
pub(crate) async fn fetch_playlist(
    client: &HttpClient,
    url: &Url,
    headers: &HeaderMap,
) -> Result<LoadedPlaylist, DownloadError> {
    let cache_key = CacheKey::new(CacheResourceType::Playlist, url.as_str());
    let body = match client.cache().get(&cache_key).await {
        Some(cached) => cached,
        None => {
            let response = client.get(url.as_str(), headers).send().await?;
            if response.status() != StatusCode::OK {
                return Err(DownloadError::http_status(
                    response.status(),
                    url.as_str(),
                    "playlist fetch",
                ));
            }
            let body = response.bytes().await?;
            client.cache().put(cache_key, body.clone(), PLAYLIST_TTL).await;
            body
        }
    };

    match parse_playlist_res(&body) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(playlist)) => Ok(LoadedPlaylist::Master(playlist)),
        Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => Ok(LoadedPlaylist::Media(playlist)),
        Err(e) => Err(DownloadError::playlist(format!(
            "failed to decode playlist {url}: {e}"
        ))),
    }
}

/// Pick a variant from a master playlist.
///
/// Default is the highest declared bandwidth; `worst` selects the lowest. A
/// concrete quality hint that appears as a substring of a variant's
/// resolution narrows the candidates first.
pub(crate) fn select_variant<'a>(
    master: &'a MasterPlaylist,
    quality_hint: &str,
) -> Result<&'a VariantStream, DownloadError> {
    if master.variants.is_empty() {
        return Err(DownloadError::playlist("master playlist has no variants"));
    }

    let hint = quality_hint.trim();
    if !hint.is_empty() && hint != "best" && hint != "worst" {
        let best_match = master
            .variants
            .iter()
            .filter(|v| {
                v.resolution
                    .as_ref()
                    .is_some_and(|r| format!("{}x{}", r.width, r.height).contains(hint))
            })
            .max_by_key(|v| v.bandwidth);
        if let Some(variant) = best_match {
            debug!(hint, bandwidth = variant.bandwidth, "variant matched quality hint");
            return Ok(variant);
        }
    }

    let selected = if hint == "worst" {
        master.variants.iter().min_by_key(|v| v.bandwidth)
    } else {
        master.variants.iter().max_by_key(|v| v.bandwidth)
    };
    selected.ok_or_else(|| DownloadError::playlist("no suitable variant found"))
}

/// Walk the media playlist in order, carrying the effective key forward from
/// each key tag, resolving segment URIs against the playlist URL. Segments
/// with unparseable URIs are dropped with a warning; an empty result fails.
pub(crate) fn prepare_segments(
    playlist: &MediaPlaylist,
    playlist_url: &Url,
    headers: &HeaderMap,
) -> Result<Vec<SegmentInfo>, DownloadError> {
    let mut current_key: Option<KeyDescriptor> = None;
    let mut segments = Vec::with_capacity(playlist.segments.len());

    for (i, segment) in playlist.segments.iter().enumerate() {
        if let Some(key) = &segment.key {
            current_key = match &key.method {
                KeyMethod::None => None,
                KeyMethod::AES128 => {
                    let key_uri = key.uri.as_deref().ok_or_else(|| {
                        DownloadError::decryption("encryption key has no URI")
                    })?;
                    let uri = playlist_url.join(key_uri).map_err(|e| {
                        DownloadError::decryption(format!(
                            "could not resolve key URI {key_uri}: {e}"
                        ))
                    })?;
                    Some(KeyDescriptor {
                        uri,
                        iv: key.iv.clone(),
                    })
                }
                other => {
                    return Err(DownloadError::decryption(format!(
                        "unsupported encryption method {other:?}"
                    )));
                }
            };
        }

        let uri = match playlist_url.join(&segment.uri) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(uri = %segment.uri, error = %e, "dropping segment with invalid URI");
                continue;
            }
        };
        segments.push(SegmentInfo {
            uri,
            duration: segment.duration,
            key: current_key.clone(),
            sequence: playlist.media_sequence + i as u64,
            headers: headers.clone(),
            retries: std::sync::atomic::AtomicU32::new(0),
        });
    }

    if segments.is_empty() {
        return Err(DownloadError::playlist("no valid segments found in playlist"));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_media(src: &str) -> MediaPlaylist {
        match parse_playlist_res(src.as_bytes()).unwrap() {
            m3u8_rs::Playlist::MediaPlaylist(p) => p,
            _ => panic!("expected media playlist"),
        }
    }

    fn parse_master(src: &str) -> MasterPlaylist {
        match parse_playlist_res(src.as_bytes()).unwrap() {
            m3u8_rs::Playlist::MasterPlaylist(p) => p,
            _ => panic!("expected master playlist"),
        }
    }

    const MASTER: &str = "#EXTM3U\n\
        #EXT-X-STREAM-INF:BANDWIDTH=300000,RESOLUTION=640x360\n\
        low/index.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=1200000,RESOLUTION=1280x720\n\
        high/index.m3u8\n";

    #[test]
    fn selects_highest_bandwidth_by_default() {
        let master = parse_master(MASTER);
        let variant = select_variant(&master, "best").unwrap();
        assert_eq!(variant.bandwidth, 1_200_000);
        assert_eq!(variant.uri, "high/index.m3u8");
    }

    #[test]
    fn worst_selects_lowest_bandwidth() {
        let master = parse_master(MASTER);
        let variant = select_variant(&master, "worst").unwrap();
        assert_eq!(variant.bandwidth, 300_000);
    }

    #[test]
    fn quality_hint_matches_resolution_substring() {
        let master = parse_master(MASTER);
        let variant = select_variant(&master, "360").unwrap();
        assert_eq!(variant.bandwidth, 300_000);

        // A hint matching nothing falls back to highest bandwidth.
        let variant = select_variant(&master, "2160").unwrap();
        assert_eq!(variant.bandwidth, 1_200_000);
    }

    #[test]
    fn key_carries_forward_until_next_tag() {
        let playlist = parse_media(
            "#EXTM3U\n\
             #EXT-X-TARGETDURATION:4\n\
             #EXT-X-MEDIA-SEQUENCE:10\n\
             #EXTINF:4.0,\nseg0.ts\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"keyA\",IV=0x00000000000000000000000000000001\n\
             #EXTINF:4.0,\nseg1.ts\n\
             #EXTINF:4.0,\nseg2.ts\n\
             #EXT-X-KEY:METHOD=NONE\n\
             #EXTINF:4.0,\nseg3.ts\n\
             #EXT-X-ENDLIST\n",
        );
        let base = Url::parse("http://example.com/stream/index.m3u8").unwrap();
        let segments = prepare_segments(&playlist, &base, &HeaderMap::new()).unwrap();
        assert_eq!(segments.len(), 4);

        assert!(segments[0].key.is_none());
        let key1 = segments[1].key.as_ref().unwrap();
        assert_eq!(key1.uri.as_str(), "http://example.com/stream/keyA");
        assert!(key1.iv.as_deref().unwrap().ends_with("01"));
        assert!(segments[2].key.is_some());
        assert!(segments[3].key.is_none());

        // Sequence numbers follow the playlist base.
        assert_eq!(segments[0].sequence, 10);
        assert_eq!(segments[3].sequence, 13);

        // Relative URIs resolved against the playlist URL.
        assert_eq!(segments[0].uri.as_str(), "http://example.com/stream/seg0.ts");
    }

    #[test]
    fn unsupported_key_method_fails() {
        let playlist = parse_media(
            "#EXTM3U\n\
             #EXT-X-TARGETDURATION:4\n\
             #EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"key\"\n\
             #EXTINF:4.0,\nseg0.ts\n\
             #EXT-X-ENDLIST\n",
        );
        let base = Url::parse("http://example.com/index.m3u8").unwrap();
        let err = prepare_segments(&playlist, &base, &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, DownloadError::Decryption { .. }));
    }

    #[test]
    fn empty_playlist_fails() {
        let playlist = parse_media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-ENDLIST\n",
        );
        let base = Url::parse("http://example.com/index.m3u8").unwrap();
        assert!(prepare_segments(&playlist, &base, &HeaderMap::new()).is_err());
    }
}
