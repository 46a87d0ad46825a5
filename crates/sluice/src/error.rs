use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("requested range not satisfiable for {url}")]
    RangeNotSatisfiable { url: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("segment fetch error: {reason}")]
    SegmentFetch { reason: String, retryable: bool },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("inconsistent download state: {reason}")]
    Integrity { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("cache error: {reason}")]
    Cache { reason: String },

    #[error("no streams available for media `{title}`")]
    NoStreams { title: String },

    #[error("transcoder `{binary}` not found in PATH")]
    DependencyMissing { binary: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Self::RangeNotSatisfiable { url: url.into() };
        }
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::Integrity {
            reason: reason.into(),
        }
    }

    /// Whether a retry within the configured budget may succeed.
    ///
    /// Transport failures and transient server responses (5xx, 408, 429) are
    /// retryable. Client errors, malformed payloads, and filesystem failures
    /// are not. Cancellation is never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::Configuration { .. }
            | Self::Playlist { .. }
            | Self::Decryption { .. }
            | Self::Io { .. }
            | Self::DependencyMissing { .. }
            | Self::NoStreams { .. }
            | Self::RangeNotSatisfiable { .. }
            | Self::Internal { .. } => false,
            Self::HttpStatus { status, .. } => is_retryable_status(*status),
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::Integrity { .. } | Self::Cache { .. } => true,
        }
    }

    /// Whether the error forbids another attempt at the stream level.
    ///
    /// A 416 is not terminal: the dispatcher recovers by re-issuing the
    /// request without a range.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::RangeNotSatisfiable { .. } => false,
            other => !other.is_retryable(),
        }
    }
}

/// Retry classification for response statuses: server errors plus 408 and
/// 429. Other client errors and 304 never retry.
pub fn is_retryable_status(status: StatusCode) -> bool {
    if status == StatusCode::NOT_MODIFIED {
        return false;
    }
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, body read, and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
