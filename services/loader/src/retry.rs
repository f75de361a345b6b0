//! Fixed-delay retry around batch writes.
//!
//! Only store-layer failures are retried; anything else (for instance a decode
//! error that reached a write path) is returned on the first attempt.
//!
//! A retried batch is written again in full. If a prior attempt committed and
//! only the acknowledgement was lost, the retry duplicates those rows: delivery
//! is at-least-once per batch.

use crate::error::IngestError;
use crate::records::Shape;
use backoff::backoff::{Backoff, Constant};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bounded, fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` counts the first try and is clamped to at least one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Runs write operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryingWriter {
    policy: RetryPolicy,
}

impl RetryingWriter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Exhaustion yields `PersistenceFailed`.
    ///
    /// A pool-acquire timeout is backpressure: the write is tried again
    /// without spending an attempt or sleeping.
    pub async fn write<T, F, Fut>(
        &self,
        shape: Shape,
        file: &str,
        mut op: F,
    ) -> Result<T, IngestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut backoff = Constant::new(self.policy.delay);
        let mut attempt = 0u32;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            shape = %shape,
                            file = %file,
                            attempt = attempt + 1,
                            "Write succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(IngestError::Persistence(e)) if e.is_pool_exhausted() => {
                    debug!(
                        shape = %shape,
                        file = %file,
                        "Connection pool exhausted, waiting for a free connection"
                    );
                    metrics::counter!("loader.write.pool_waits").increment(1);
                }
                Err(IngestError::Persistence(e)) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        error!(
                            shape = %shape,
                            file = %file,
                            attempts = attempt,
                            error = %e,
                            "Write failed permanently, dropping batch"
                        );
                        return Err(IngestError::PersistenceFailed {
                            attempts: attempt,
                            source: e,
                        });
                    }

                    metrics::counter!("loader.write.retries").increment(1);
                    if let Some(delay) = backoff.next_backoff() {
                        warn!(
                            shape = %shape,
                            file = %file,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Write attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn transient() -> IngestError {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
        IngestError::Persistence(StoreError::Database(sqlx::Error::Io(reset)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_attempt() {
        let delay = Duration::from_secs(2);
        let writer = RetryingWriter::new(RetryPolicy::new(3, delay));
        let calls = AtomicU32::new(0);
        let started = Mutex::new(Vec::new());

        let result = writer
            .write(Shape::Status, "test.json", || {
                started.lock().unwrap().push(Instant::now());
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(transient())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let started = started.into_inner().unwrap();
        assert_eq!(started.len(), 3);
        for pair in started.windows(2) {
            assert_eq!(pair[1] - pair[0], delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_reports_persistence_failed() {
        let writer = RetryingWriter::new(RetryPolicy::new(4, Duration::from_millis(500)));
        let calls = AtomicU32::new(0);
        let begin = Instant::now();

        let result: Result<(), _> = writer
            .write(Shape::Status, "test.json", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceFailed);
        assert!(matches!(err, IngestError::PersistenceFailed { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(begin.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy_never_sleeps() {
        let writer = RetryingWriter::new(RetryPolicy::new(1, Duration::from_secs(60)));
        let begin = Instant::now();

        let result: Result<(), _> = writer
            .write(Shape::Status, "test.json", || async { Err(transient()) })
            .await;

        assert!(matches!(result, Err(IngestError::PersistenceFailed { attempts: 1, .. })));
        assert_eq!(begin.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_non_persistence_error_is_not_retried() {
        let writer = RetryingWriter::new(RetryPolicy::new(3, Duration::from_millis(1)));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = writer
            .write(Shape::Status, "test.json", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(IngestError::MalformedInput("bad".to_string())) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::MalformedInput);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_exhaustion_does_not_spend_attempts() {
        let writer = RetryingWriter::new(RetryPolicy::new(1, Duration::from_secs(2)));
        let calls = AtomicU32::new(0);
        let begin = Instant::now();

        let result = writer
            .write(Shape::Detection, "test.json", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 3 {
                        Err(IngestError::Persistence(StoreError::Database(
                            sqlx::Error::PoolTimedOut,
                        )))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(begin.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }
}
