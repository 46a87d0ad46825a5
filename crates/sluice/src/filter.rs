//! Stream selection predicates. Filters compose with AND semantics; the
//! accepted set is independent of chain order, only the first-rejection log
//! line differs.

use tracing::debug;

use crate::config::DownloadConfig;
use crate::media::{Stream, StreamKind};

pub trait StreamFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn accept(&self, stream: &Stream) -> bool;
}

/// Case-insensitive exact quality match. The `best`/`worst` pseudo-values are
/// resolved to a concrete label by [`filters_for_streams`] before this filter
/// is built.
pub struct QualityFilter(pub String);

impl StreamFilter for QualityFilter {
    fn name(&self) -> &'static str {
        "quality"
    }

    fn accept(&self, stream: &Stream) -> bool {
        self.0.is_empty() || stream.quality.eq_ignore_ascii_case(&self.0)
    }
}

pub struct VideoOnlyFilter;

impl StreamFilter for VideoOnlyFilter {
    fn name(&self) -> &'static str {
        "video-only"
    }

    fn accept(&self, stream: &Stream) -> bool {
        matches!(stream.kind, StreamKind::Video | StreamKind::Hls)
    }
}

pub struct AudioOnlyFilter;

impl StreamFilter for AudioOnlyFilter {
    fn name(&self) -> &'static str {
        "audio-only"
    }

    fn accept(&self, stream: &Stream) -> bool {
        stream.kind == StreamKind::Audio
    }
}

pub struct NoSubtitleFilter;

impl StreamFilter for NoSubtitleFilter {
    fn name(&self) -> &'static str {
        "no-subtitle"
    }

    fn accept(&self, stream: &Stream) -> bool {
        stream.kind != StreamKind::Subtitle
    }
}

/// Keeps playlist entries whose integer id falls inside `[start, end]`;
/// either bound may be open. Non-playlist streams pass through.
pub struct PlaylistWindowFilter {
    pub start: Option<u32>,
    pub end: Option<u32>,
}

impl StreamFilter for PlaylistWindowFilter {
    fn name(&self) -> &'static str {
        "playlist-window"
    }

    fn accept(&self, stream: &Stream) -> bool {
        if stream.kind != StreamKind::Playlist {
            return true;
        }
        let Ok(id) = stream.id.parse::<u32>() else {
            return false;
        };
        self.start.is_none_or(|start| id >= start) && self.end.is_none_or(|end| id <= end)
    }
}

/// Resolve `best`/`worst` over the candidate set: rank the distinct quality
/// labels numerically descending where parseable, lexicographically
/// descending otherwise, and pick the first (`best`) or last (`worst`).
fn resolve_quality(quality: &str, streams: &[Stream]) -> Option<String> {
    let mut labels: Vec<&str> = Vec::new();
    for stream in streams {
        if !labels.contains(&stream.quality.as_str()) {
            labels.push(&stream.quality);
        }
    }
    if labels.is_empty() {
        return None;
    }
    labels.sort_by(|a, b| match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => y.cmp(&x),
        _ => b.cmp(a),
    });
    let target = if quality == "worst" {
        labels[labels.len() - 1]
    } else {
        labels[0]
    };
    Some(target.to_owned())
}

/// Build the predicate chain for a candidate set per the configured options.
pub fn filters_for_streams(
    config: &DownloadConfig,
    streams: &[Stream],
) -> Vec<Box<dyn StreamFilter>> {
    let mut filters: Vec<Box<dyn StreamFilter>> = Vec::new();

    let quality = if config.quality.is_empty() {
        "best"
    } else {
        config.quality.as_str()
    };
    if quality == "best" || quality == "worst" {
        if let Some(target) = resolve_quality(quality, streams) {
            filters.push(Box::new(QualityFilter(target)));
        }
    } else {
        filters.push(Box::new(QualityFilter(quality.to_owned())));
    }

    if config.video_only {
        filters.push(Box::new(VideoOnlyFilter));
    }
    if config.audio_only {
        filters.push(Box::new(AudioOnlyFilter));
    }
    if !config.subtitle {
        filters.push(Box::new(NoSubtitleFilter));
    }
    if config.playlist_start.is_some() || config.playlist_end.is_some() {
        filters.push(Box::new(PlaylistWindowFilter {
            start: config.playlist_start,
            end: config.playlist_end,
        }));
    }

    filters
}

/// True when some filter rejects the stream; logs the first rejecting
/// predicate.
pub fn should_skip(stream: &Stream, filters: &[Box<dyn StreamFilter>]) -> bool {
    for filter in filters {
        if !filter.accept(stream) {
            debug!(id = %stream.id, filter = filter.name(), "skipping stream");
            return true;
        }
    }
    false
}
