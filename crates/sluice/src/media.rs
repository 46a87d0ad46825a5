use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The transport/content class of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Image,
    Subtitle,
    Playlist,
    Hls,
    Document,
    Other,
}

/// A single downloadable stream of a media item: one quality/format/transport.
///
/// Extractors produce these as pure values; the engine never reaches back
/// into the site that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    /// Unique id within the media item.
    pub id: String,

    /// Display title; the default output name derives from it.
    #[serde(default)]
    pub title: String,

    pub kind: StreamKind,

    /// Absolute URL of the stream payload.
    pub url: String,

    /// Declared container format, e.g. `mp4`.
    #[serde(default)]
    pub format: String,

    /// Declared quality label, e.g. `1080p` or `320kbps`.
    #[serde(default)]
    pub quality: String,

    /// Declared total size in bytes. A hint only: server-observed sizes
    /// drive every decision point.
    #[serde(default)]
    pub size: Option<u64>,

    /// Duration in seconds, when known.
    #[serde(default)]
    pub duration: Option<f64>,

    /// Per-stream request headers, merged over the client defaults.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Suggested relative save path.
    #[serde(default)]
    pub save_as: Option<String>,
}

/// A downloadable media item with its candidate streams in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub title: String,
    pub streams: Vec<Stream>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Stream {
    /// Declared size when positive, otherwise `None`.
    pub fn declared_size(&self) -> Option<u64> {
        self.size.filter(|s| *s > 0)
    }
}
