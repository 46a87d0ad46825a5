use std::collections::HashMap;
use std::time::Duration;

use humansize::{BINARY, format_size};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// Convert a per-stream header map into a `HeaderMap`, skipping entries that
/// do not form valid header names or values.
pub fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(name = %name, "skipping malformed header"),
        }
    }
    map
}

/// Human-readable byte count, binary units.
pub fn format_bytes(bytes: u64) -> String {
    format_size(bytes, BINARY)
}

/// Paces a read loop to an approximate bytes-per-second rate by sleeping in
/// 100 ms windows.
pub struct RatePacer {
    rate: u64,
    window: Duration,
    budget: u64,
}

impl RatePacer {
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            window: Duration::from_millis(100),
            budget: rate / 10,
        }
    }

    /// Account `n` transferred bytes, sleeping once the per-window budget is
    /// spent. A rate of 0 disables pacing.
    pub async fn pace(&mut self, n: usize) {
        if self.rate == 0 {
            return;
        }
        self.budget = self.budget.saturating_sub(n as u64);
        if self.budget == 0 {
            tokio::time::sleep(self.window).await;
            self.budget = (self.rate / 10).max(1);
        }
    }
}
