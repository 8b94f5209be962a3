//! Bounded retry for transient store contention.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::StorageError;

/// Retry budget and wait bounds for store operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Upper bound on a single lock or connection wait in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 10,
            max_delay_ms: 500,
            lock_timeout_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Creates a RetryPolicy from environment variables.
    ///
    /// Environment variables:
    /// - `NUMGEN_MAX_RETRIES`: Maximum retry attempts (default: 5)
    /// - `NUMGEN_RETRY_INITIAL_MS`: Initial backoff delay in ms (default: 10)
    /// - `NUMGEN_RETRY_MAX_MS`: Maximum backoff delay in ms (default: 500)
    /// - `NUMGEN_LOCK_TIMEOUT_MS`: Lock/connect wait bound in ms (default: 2000)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_retries: env_or("NUMGEN_MAX_RETRIES", default.max_retries),
            initial_delay_ms: env_or("NUMGEN_RETRY_INITIAL_MS", default.initial_delay_ms),
            max_delay_ms: env_or("NUMGEN_RETRY_MAX_MS", default.max_delay_ms),
            lock_timeout_ms: env_or("NUMGEN_LOCK_TIMEOUT_MS", default.lock_timeout_ms),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Creates an exponential backoff builder with jitter.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_retries)
            .with_jitter()
    }

    /// Runs `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// Only errors for which [`StorageError::is_retryable`] holds are retried.
    /// The last error is returned once the budget is exhausted.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        op: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        op.retry(self.backoff())
            .when(StorageError::is_retryable)
            .notify(|err: &StorageError, dur: Duration| {
                tracing::warn!(
                    operation,
                    key,
                    error = %err,
                    retry_in = ?dur,
                    "store operation failed, retrying"
                );
            })
            .await
    }

    /// Synchronous form of [`run`](Self::run), sleeping on the calling thread
    /// between attempts.
    pub fn run_blocking<T, F>(
        &self,
        operation: &'static str,
        key: &str,
        op: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Result<T, StorageError>,
    {
        backon::BlockingRetryable::retry(op, self.backoff())
            .when(StorageError::is_retryable)
            .notify(|err: &StorageError, dur: Duration| {
                tracing::warn!(
                    operation,
                    key,
                    error = %err,
                    retry_in = ?dur,
                    "store operation failed, retrying"
                );
            })
            .call()
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            lock_timeout_ms: 10,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay_ms, 10);
        assert_eq!(policy.max_delay_ms, 500);
        assert_eq!(policy.lock_timeout(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let value = fast(3)
            .run("increment", "k", move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::Conflict("k".into()))
                } else {
                    Ok(7u64)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_last_error() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let err = fast(2)
            .run("increment", "k", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<u64, _>(StorageError::Conflict("k".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let err = fast(5)
            .run("increment", "k", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<u64, _>(StorageError::Exhausted("k".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Exhausted(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_run_retries_transient_errors() {
        let mut attempts = 0;
        let value = fast(3)
            .run_blocking("open", "/tmp/db", || {
                attempts += 1;
                if attempts < 3 {
                    Err(StorageError::LockTimeout(Duration::from_millis(1)))
                } else {
                    Ok("opened")
                }
            })
            .unwrap();
        assert_eq!(value, "opened");
        assert_eq!(attempts, 3);
    }

    #[test]
    fn blocking_run_stops_on_permanent_error() {
        let mut attempts = 0;
        let err = fast(3)
            .run_blocking("open", "/tmp/db", || {
                attempts += 1;
                Err::<(), _>(StorageError::InvalidDescriptor("x".into()))
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidDescriptor(_)));
        assert_eq!(attempts, 1);
    }
}
