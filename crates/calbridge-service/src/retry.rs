//! Retry and rate limiting machinery shared by both adapters.
//!
//! Retries are bounded loops around idempotent operations; only
//! `RateLimited` and `Transient` errors re-enter the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::error::{AdapterError, AdapterResult};

/// Bounded exponential backoff with deterministic jitter
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(attempts: u32, backoff_seconds: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::from_secs(backoff_seconds.max(1)),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Delay before retrying `attempt` (1-based), doubled per attempt with
    /// sub-second jitter derived from the clock
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1 << attempt.min(6));
        let capped = exp.min(self.max_delay);
        let jitter_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| u64::from(d.subsec_millis() % 250));
        capped + Duration::from_millis(jitter_ms)
    }

    /// ## Summary
    /// Runs an idempotent operation, retrying `RateLimited` and `Transient`
    /// failures within the attempt budget.
    ///
    /// ## Errors
    /// Returns the last error once the budget is exhausted, and any
    /// non-retryable error immediately.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> AdapterResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = AdapterResult<T>> + Send,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.attempts => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        error = %err,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Retrying after backoff"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Token-bucket limiter bounding in-flight requests per adapter.
///
/// Permits return to the bucket when the guard drops, so a slow response
/// naturally throttles the caller.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(concurrent_requests: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrent_requests.max(1))),
        }
    }

    /// ## Summary
    /// Acquires a request permit, waiting when the bucket is empty.
    ///
    /// ## Errors
    /// Returns `Fatal` if the limiter was closed, which cannot happen during
    /// normal operation.
    pub async fn acquire(&self) -> AdapterResult<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| AdapterError::Fatal(format!("rate limiter closed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_budget() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let result: AdapterResult<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AdapterError::Transient("boom".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let result: AdapterResult<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AdapterError::NotFound("gone".into())) }
            })
            .await;
        assert!(matches!(result, Err(AdapterError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 1 {
                        Err(AdapterError::RateLimited("slow down".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }
}
