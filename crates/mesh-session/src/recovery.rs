//! Bounded exponential backoff for relay reconnects.
//!
//! The first attempt runs immediately; each failed attempt waits
//! `initial_delay * multiplier^(n-1)`, capped at `max_delay` and optionally
//! spread by +/-10% jitter, before the next one. Waiting is cancellable.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy for reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Factor applied to the delay after each failure.
    pub backoff_multiplier: f64,
    /// Whether to spread delays by +/-10%.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (1-based), before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        // Non-negative and bounded by max_delay, so the cast cannot truncate meaningfully.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.use_jitter {
            return delay;
        }
        let jitter = (rand::random::<f64>() - 0.5) * 0.2;
        let millis = delay.as_millis() as f64 * (1.0 + jitter);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(millis.max(0.0) as u64).min(self.max_delay)
    }
}

/// Why a retried operation gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error.
    Exhausted { attempts: u32, last_error: E },
    /// The cancellation token fired.
    Cancelled,
}

/// Run `operation` until it succeeds, attempts run out, or `cancel` fires.
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(
            target: "mesh.session.recovery",
            operation = operation_name,
            attempt = attempt,
            max_attempts = max_attempts,
            "Attempting operation"
        );

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = operation() => result,
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        target: "mesh.session.recovery",
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(e) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    target: "mesh.session.recovery",
                    operation = operation_name,
                    attempt = attempt,
                    error = %e,
                    next_delay_ms = delay.as_millis(),
                    "Attempt failed, will retry"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                warn!(
                    target: "mesh.session.recovery",
                    operation = operation_name,
                    attempts = attempt,
                    error = %e,
                    "Giving up after max attempts"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            use_jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(4), Duration::from_millis(4000));
        assert_eq!(policy.base_delay(5), Duration::from_secs(5));
        assert_eq!(policy.base_delay(30), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = retry_with_backoff("test", &no_jitter(), &cancel, || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry_with_backoff("test", &no_jitter(), &cancel, || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("refused")
            }
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last_error: "refused"
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryError<&str>> =
            retry_with_backoff("test", &no_jitter(), &cancel, || async { Err("refused") }).await;

        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
