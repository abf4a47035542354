//! Injectable retry policy for network operations
//!
//! Wraps `backoff::ExponentialBackoff` behind a small policy object so
//! every network call site shares one retry shape and tests can run with
//! zero delays.

use std::future::Future;
use std::time::Duration;

use backoff::{future::retry, ExponentialBackoff};
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Retry policy: bounded attempts with exponential backoff.
/// Only errors classified retryable by [`Error::is_retryable`] are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Policy with no delays, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        // max_elapsed_time bounds total time; attempts are bounded
        // separately in run() since backoff counts by wall clock.
        ExponentialBackoff {
            initial_interval: self.base_delay,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run `op` until it succeeds, returns a permanent error, or the
    /// attempt budget is exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let max = self.max_attempts;

        retry(self.backoff(), || {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            let fut = op();
            async move {
                match fut.await {
                    Ok(v) => Ok(v),
                    Err(e) if e.is_retryable() && n < max => {
                        warn!(op = label, attempt = n, error = %e, "retrying transient error");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let policy = RetryPolicy::immediate(5);
        let calls = AtomicU32::new(0);

        let result = policy
            .run("probe", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Error::Rpc("flaky".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let policy = RetryPolicy::immediate(5);
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run("probe", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Config("bad".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhausted() {
        let policy = RetryPolicy::immediate(3);
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run("probe", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Broadcast("relay down".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::Broadcast(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
