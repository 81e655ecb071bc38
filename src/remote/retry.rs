//! Bounded retry with exponential backoff
//!
//! Wraps individual remote operations: `Network` failures back off
//! exponentially with jitter, `RateLimited` honors the server's retry-after
//! hint when present, and everything else propagates immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::RemoteError;

/// Retry schedule for remote operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay, retry-after hints included
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), exponential with jitter.
    fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << (retry - 1).min(16));
        let capped = exp.min(self.max_delay);
        // Up to 25% jitter keeps concurrent targets from retrying in lockstep
        let jitter = capped.mul_f64(rand::rng().random_range(0.0..0.25));
        capped + jitter
    }
}

/// Run `call` until it succeeds, fails terminally, or the attempt budget is
/// spent. The last error is returned on exhaustion.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < attempts => {
                let delay = match &error {
                    RemoteError::RateLimited {
                        retry_after: Some(hint),
                    } => (*hint).min(policy.max_delay),
                    _ => policy.backoff_delay(attempt),
                };
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying remote operation"
                );
                tokio::time::sleep(delay).await;
                last_error = Some(error);
            }
            Err(error) => return Err(error),
        }
    }

    // Unreachable unless every attempt was retryable and consumed
    Err(last_error.unwrap_or_else(|| RemoteError::Network("retry budget exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&test_policy(), "commit_file", move || {
            let counter = counter.clone();
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(RemoteError::RateLimited {
                        retry_after: Some(Duration::from_secs(1)),
                    }),
                    _ => Ok("sha"),
                }
            }
        })
        .await;

        assert_eq!(result, Ok("sha"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_exhaust_attempt_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry(&test_policy(), "read_file", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Network("connection reset".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(RemoteError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_errors_are_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry(&test_policy(), "head", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Auth("bad credentials".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(RemoteError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_propagates_immediately() {
        let result: Result<(), _> = with_retry(&test_policy(), "commit_file", || async {
            Err(RemoteError::Conflict("branch moved".into()))
        })
        .await;
        assert!(matches!(result, Err(RemoteError::Conflict(_))));
    }
}
