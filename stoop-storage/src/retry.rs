//! Timeout and retry wrapper for backend calls.

use std::future::Future;
use std::time::Duration;

use stoop_core::{RetryConfig, SyncError, SyncResult};
use tracing::{debug, warn};

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// exhausts `policy.max_retries` extra attempts.
///
/// Each attempt is bounded by `timeout`; an elapsed timeout counts as a
/// retryable [`SyncError::Timeout`]. Backoff between attempts follows
/// [`RetryConfig::backoff_for`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryConfig,
    timeout: Duration,
    operation: &'static str,
    target: &str,
    mut attempt: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut retries = 0u32;
    loop {
        let outcome = match tokio::time::timeout(timeout, attempt()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout { after: timeout }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retries < policy.max_retries => {
                retries += 1;
                let delay = policy.backoff_for(retries);
                debug!(
                    operation = operation,
                    target = %target,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(
                    operation = operation,
                    target = %target,
                    retries = retries,
                    error = %err,
                    "Backend call failed"
                );
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_up_to_limit() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = with_retry(
            &quick_policy(3),
            Duration::from_secs(1),
            "fetch",
            "directory",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::transient("connection reset")) }
            },
        )
        .await;

        assert!(matches!(result, Err(SyncError::TransientNetwork { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = with_retry(
            &quick_policy(3),
            Duration::from_secs(1),
            "fetch",
            "directory",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::not_found("directory")) }
            },
        )
        .await;

        assert_eq!(result, Err(SyncError::not_found("directory")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            &quick_policy(2),
            Duration::from_secs(1),
            "fetch",
            "directory",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(SyncError::transient("blip"))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempts_time_out() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = with_retry(
            &quick_policy(1),
            Duration::from_millis(50),
            "fetch",
            "directory",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(
            result,
            Err(SyncError::Timeout {
                after: Duration::from_millis(50)
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
