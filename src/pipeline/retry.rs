//! Exponential backoff shared by producers and consumers.

use crate::error::{EtlError, EtlResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Retry policy for a single page read or batch write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out.
    ///
    /// `on_retry` is called with the failed attempt number before each sleep.
    /// Cancellation is checked after every failed attempt and during the sleep.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut on_retry: impl FnMut(u32, &EtlError),
        mut op: F,
    ) -> EtlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EtlResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if cancel.is_cancelled() {
                return Err(EtlError::cancelled(operation));
            }
            if attempt >= max_attempts {
                return Err(EtlError::retry_exhausted(
                    operation,
                    attempt,
                    err.to_string(),
                ));
            }

            on_retry(attempt, &err);
            tokio::select! {
                _ = tokio::time::sleep(self.delay_for(attempt)) => {}
                _ = cancel.cancelled() => return Err(EtlError::cancelled(operation)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut retries = Vec::new();
        let result = fast_policy(3)
            .run(
                "fetch page",
                &CancellationToken::new(),
                |attempt, _| retries.push(attempt),
                || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(EtlError::transient("reset", "retry"))
                        } else {
                            Ok(7)
                        }
                    }
                },
            )
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let result: EtlResult<()> = fast_policy(2)
            .run("write batch", &CancellationToken::new(), |_, _| {}, || async {
                Err(EtlError::transient("reset", "retry"))
            })
            .await;
        match result {
            Err(EtlError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: EtlResult<()> = fast_policy(5)
            .run("write batch", &CancellationToken::new(), |_, _| {}, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EtlError::database("syntax error", None)) }
            })
            .await;
        assert!(matches!(result, Err(EtlError::Database { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: EtlResult<()> = fast_policy(5)
            .run("fetch page", &cancel, |_, _| {}, || async {
                Err(EtlError::transient("reset", "retry"))
            })
            .await;
        assert!(matches!(result, Err(EtlError::Cancelled { .. })));
    }
}
