//! Shared retry-with-backoff machinery for streams, chunks, segments, and
//! keys. The backoff shape differs per call site; the loop, cancellation
//! handling, and error classification are common.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DownloadError;

/// How the delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * n` for retry `n`.
    Linear,
    /// `base * n²` for retry `n`.
    Quadratic,
    /// `base * 2^(n-1)` for retry `n`.
    Exponential,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay unit.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// When true, adds random jitter of `[0, base_delay/2)`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Per-chunk policy: 3 extra attempts, `min(n s, 10 s)` between them.
    pub fn chunk() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::Linear,
            jitter: false,
        }
    }

    /// Per-segment/key policy: `max(retry_count, 3)` attempts, `n * 1 s`,
    /// uncapped.
    pub fn segment(budget: u32) -> Self {
        Self {
            max_retries: budget.max(3),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::MAX,
            backoff: Backoff::Linear,
            jitter: false,
        }
    }

    /// Outer per-stream policy: `min(n² s, 30 s)` between attempts.
    pub fn stream(retry_count: u32) -> Self {
        Self {
            max_retries: retry_count.max(1).saturating_sub(1),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Quadratic,
            jitter: false,
        }
    }

    /// Compute the delay before retry number `n` (1-indexed).
    pub fn delay_for_retry(&self, n: u32) -> Duration {
        let multiplier = match self.backoff {
            Backoff::Linear => u64::from(n),
            Backoff::Quadratic => u64::from(n).saturating_mul(u64::from(n)),
            Backoff::Exponential => 1u64.checked_shl(n.saturating_sub(1)).unwrap_or(u64::MAX),
        };
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_ms.saturating_mul(multiplier));
        let capped = delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }
        let jitter_range_ms = base_ms / 2;
        if jitter_range_ms == 0 {
            return capped;
        }
        let jitter_ms = rand::rng().random_range(0..jitter_range_ms);
        capped
            .saturating_add(Duration::from_millis(jitter_ms))
            .min(self.max_delay)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    Success(T),
    /// Failed with a retryable error (transport, 5xx, timeout).
    Retry(DownloadError),
    /// Failed with a terminal error (4xx, malformed payload, cancellation).
    Fail(DownloadError),
}

impl<T> RetryAction<T> {
    /// Classify an error by its own retryability.
    pub fn from_error(err: DownloadError) -> Self {
        if err.is_retryable() {
            Self::Retry(err)
        } else {
            Self::Fail(err)
        }
    }
}

/// Run `operation` under `policy`, sleeping between retryable failures and
/// bailing out the moment the token is cancelled. The closure receives the
/// 0-indexed attempt number.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, DownloadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    for attempt in 0..=policy.max_retries {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_retry(attempt + 1);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(DownloadError::Internal {
        reason: "retry loop exited without result".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn linear(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(1),
            backoff: Backoff::Linear,
            jitter: false,
        }
    }

    #[test]
    fn chunk_backoff_is_linear_and_capped() {
        let policy = RetryPolicy::chunk();
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for_retry(25), Duration::from_secs(10));
    }

    #[test]
    fn stream_backoff_is_quadratic_and_capped() {
        let policy = RetryPolicy::stream(10);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(5), Duration::from_secs(25));
        assert_eq!(policy.delay_for_retry(6), Duration::from_secs(30));
    }

    #[test]
    fn segment_budget_has_floor_of_three() {
        assert_eq!(RetryPolicy::segment(1).max_retries, 3);
        assert_eq!(RetryPolicy::segment(5).max_retries, 5);
    }

    #[test]
    fn segment_backoff_is_linear_and_uncapped() {
        let policy = RetryPolicy::segment(50);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for_retry(40), Duration::from_secs(40));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            jitter: true,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
            max_retries: 3,
            backoff: Backoff::Exponential,
        };
        for _ in 0..32 {
            assert!(policy.delay_for_retry(10) <= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let token = CancellationToken::new();
        let result =
            retry_with_backoff(&linear(3), &token, |_| async { RetryAction::Success(42u32) })
                .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn fails_immediately_on_terminal_error() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&linear(3), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::Fail(DownloadError::SegmentFetch {
                    reason: "404 not found".to_owned(),
                    retryable: false,
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausts_budget_then_fails() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&linear(2), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::Retry(DownloadError::SegmentFetch {
                    reason: "500 internal".to_owned(),
                    retryable: true,
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn recovers_on_second_attempt() {
        let token = CancellationToken::new();
        let result = retry_with_backoff(&linear(3), &token, |attempt| async move {
            if attempt == 0 {
                RetryAction::Retry(DownloadError::SegmentFetch {
                    reason: "timeout".to_owned(),
                    retryable: true,
                })
            } else {
                RetryAction::Success(99u32)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn respects_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, _> =
            retry_with_backoff(&linear(10), &token, |_| async { RetryAction::Success(1u32) })
                .await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}
