//! Bounded retry with linear backoff.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::storage::StorageError;

/// Errors that can tell whether re-running the failed operation may help.
pub trait RetryableError {
    fn is_transient(&self) -> bool;
}

impl RetryableError for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}

/// Retries transient failures, sleeping `base_delay * n` before the n-th retry.
///
/// `max_retries` counts retries, not attempts: the default of 5 allows up to
/// six runs of the action. Zero disables retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            base_delay: Self::DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 5;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(10);

    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self::new(0)
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry)
    }

    /// Run `action` until it succeeds, fails permanently, or the retries run
    /// out. The last error is returned unchanged.
    pub async fn run<F, Fut, T, E>(&self, mut action: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut retries = 0;

        loop {
            match action().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() || retries >= self.max_retries => return Err(e),
                Err(e) => {
                    retries += 1;
                    let delay = self.delay_for(retries);
                    warn!(
                        retry = retries,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (transient: {})", self.transient)
        }
    }

    impl RetryableError for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    /// Fails transiently `failures` times, then succeeds. Records when each
    /// attempt started.
    async fn flaky(
        policy: RetryPolicy,
        failures: u32,
    ) -> (Result<u32, TestError>, Vec<Duration>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let mut times = Vec::new();

        let result = policy
            .run(|| {
                times.push(started.elapsed());
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        Err(TestError { transient: true })
                    } else {
                        Ok(n + 1)
                    }
                }
            })
            .await;

        (result, times)
    }

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures_with_linear_backoff() {
        let (result, times) = flaky(RetryPolicy::default(), 3).await;
        assert_eq!(result.unwrap(), 4);

        let gaps: Vec<u128> = times.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps.len(), 3);
        for (gap, expected) in gaps.iter().zip([10u128, 20, 30]) {
            assert!(*gap >= expected && *gap < expected + 5, "gaps: {:?}", gaps);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let (result, times) = flaky(RetryPolicy::new(2), 10).await;
        assert!(result.unwrap_err().transient);
        assert_eq!(times.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_one_attempt() {
        let (result, times) = flaky(RetryPolicy::no_retry(), 1).await;
        assert!(result.is_err());
        assert_eq!(times.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let mut attempts = 0;
        let result: Result<(), TestError> = RetryPolicy::default()
            .run(|| {
                attempts += 1;
                async { Err(TestError { transient: false }) }
            })
            .await;

        assert!(!result.unwrap_err().transient);
        assert_eq!(attempts, 1);
    }
}
