//! Deadlines and retries for calls that leave the process.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{millis, ExternalError, ExternalResult, StoreResult, StoreError};

/// Timeout and backoff settings shared by the sweeper and the dispatcher.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallPolicy {
    timeout: Duration,
    attempts: u32,
    backoff: Duration,
}

impl CallPolicy {
    pub(crate) fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.call_timeout(),
            attempts: config.store_retry_attempts.max(1),
            backoff: config.store_retry_backoff(),
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run a store call under the deadline, retrying transient failures
    /// with exponential backoff.
    pub(crate) async fn store<T, F, Fut>(&self, operation: &'static str, mut call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    operation,
                    timeout_ms: millis(self.timeout),
                }),
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(operation, attempt, error = %e, "Transient store error, backing off");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run a notifier or drafter call under the deadline. No retries here;
    /// the sweeper reschedules the obligation instead.
    pub(crate) async fn external<T, Fut>(&self, call: Fut) -> ExternalResult<T>
    where
        Fut: Future<Output = ExternalResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::Timeout {
                timeout_ms: millis(self.timeout),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(1),
            attempts,
            backoff: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .store("get", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transient("busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = policy(2)
            .store("save", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Transient("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_call_times_out() {
        let result: StoreResult<()> = policy(1)
            .store("list", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout { operation: "list", .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_external_call_is_a_transient_timeout() {
        let result: ExternalResult<()> = policy(1)
            .external(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, ExternalError::Timeout { timeout_ms: 1000 }));
    }

    #[tokio::test]
    async fn test_conflicts_are_not_retried_here() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = policy(3)
            .store("save", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Conflict {
                    id: obligation_types::ObligationId::generate(),
                    expected: 1,
                    found: 2,
                })
            })
            .await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
