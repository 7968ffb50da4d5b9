//! Exponential backoff around a single collaborator call.
//!
//! Only errors for which [`CollaboratorError::is_retryable`] holds are
//! retried. Each retryable failure is followed by a sleep of
//! `base_delay * 2^attempt` (50ms, 100ms, 200ms with the defaults), including
//! the one after the final attempt, so a fully exhausted call always spends the
//! whole backoff schedule.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::CollaboratorError;

/// Delay after the failure of attempt `attempt` (0-indexed).
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    config.base_delay.saturating_mul(factor)
}

/// Run `call` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` calls have been made. Returns the last error on failure.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut call: F,
) -> Result<T, CollaboratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let mut last_err = CollaboratorError::Unavailable("no attempts made".to_string());

    for attempt in 0..config.max_attempts {
        match call().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(item = label, attempt, "Call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => {
                let delay = compute_delay(config, attempt);
                warn!(
                    item = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                last_err = err;
            }
            Err(err) => {
                debug!(item = label, attempt, error = %err, "Non-retryable failure");
                return Err(err);
            }
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use super::*;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let config = RetryConfig::default();
        assert_eq!(compute_delay(&config, 0), Duration::from_millis(50));
        assert_eq!(compute_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(compute_delay(&config, 2), Duration::from_millis(200));
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let config = RetryConfig::default();
        let huge = compute_delay(&config, 64);
        assert!(huge >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let started = Instant::now();
        let result = with_retry(&RetryConfig::default(), "message 1", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CollaboratorError::TooManyRequests)
                } else {
                    Ok(true)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(true));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<bool, _> = with_retry(&fast_config(), "message 2", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(CollaboratorError::TooManyRequests) }
        })
        .await;

        assert_eq!(result, Err(CollaboratorError::TooManyRequests));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<bool, _> = with_retry(&fast_config(), "message 3", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(CollaboratorError::Unavailable("down".into())) }
        })
        .await;

        assert!(matches!(result, Err(CollaboratorError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
