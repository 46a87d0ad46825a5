use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Progress callback invoked with `(current, total, description)`.
/// A total of 0 means the size is not yet known.
pub type ProgressCallback = Arc<dyn Fn(u64, u64, &str) + Send + Sync>;

const MIN_EMIT_INTERVAL_MS: i64 = 100;

/// Thread-safe progress tracker with a rate-limited callback.
///
/// Workers call [`Progress::add`] with the bytes they just wrote; deltas are
/// accumulated atomically so the counter is monotonically non-decreasing
/// regardless of interleaving.
pub struct Progress {
    total: AtomicU64,
    current: AtomicU64,
    description: String,
    callback: Option<ProgressCallback>,
    last_emit_ms: AtomicI64,
}

impl Progress {
    pub fn new(total: u64, description: impl Into<String>) -> Self {
        Self {
            total: AtomicU64::new(total),
            current: AtomicU64::new(0),
            description: description.into(),
            callback: None,
            last_emit_ms: AtomicI64::new(0),
        }
    }

    pub fn with_callback(
        total: u64,
        description: impl Into<String>,
        callback: Option<ProgressCallback>,
    ) -> Self {
        Self {
            callback,
            ..Self::new(total, description)
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Adjust the total once the server reveals the real size.
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Record `delta` freshly transferred bytes. Emits the callback at most
    /// once per 100 ms; the emitted snapshot always reflects the atomically
    /// updated counter.
    pub fn add(&self, delta: u64) {
        let current = self.current.fetch_add(delta, Ordering::Relaxed) + delta;

        let Some(callback) = &self.callback else {
            return;
        };
        let now = now_millis();
        let last = self.last_emit_ms.load(Ordering::Relaxed);
        if now - last > MIN_EMIT_INTERVAL_MS
            && self
                .last_emit_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            callback(current, self.total(), &self.description);
        }
    }

    /// Force completion: pins `current` to `total` (or the bytes delivered
    /// when the total was unknown) and emits unconditionally.
    pub fn finish(&self) {
        if self.total() == 0 {
            self.total
                .store(self.current.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        let total = self.total();
        self.current.store(total, Ordering::Relaxed);
        if let Some(callback) = &self.callback {
            callback(total, total, &self.description);
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
