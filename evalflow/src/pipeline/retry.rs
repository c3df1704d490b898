//! Bounded-time retry with exponential backoff and jitter.
//!
//! The executor races each attempt against the stage timeout, sleeps
//! `base * 2^(attempt-1) + jitter` between attempts and gives up with a
//! [`StageExhaustedError`] after the last allowed attempt. It holds no
//! state between calls.

use super::ResiliencePolicy;
use crate::errors::{AttemptError, StageError, StageExhaustedError};
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Upper bound (exclusive) of the random jitter added to each backoff.
pub const DEFAULT_MAX_JITTER_MS: u64 = 500;

/// Callbacks invoked around each attempt.
///
/// Both hooks are awaited inline, so a slow observer delays the next
/// attempt.
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    /// Called before every attempt, starting at 1.
    async fn on_attempt_start(&self, _attempt: u32) {}

    /// Called after a failed attempt.
    ///
    /// `next_delay` is the backoff before the next attempt, or `None` when
    /// this was the last attempt.
    async fn on_attempt_failed(
        &self,
        _attempt: u32,
        _error: &AttemptError,
        _next_delay: Option<Duration>,
    ) {
    }
}

/// An observer that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

#[async_trait]
impl AttemptObserver for NoOpObserver {}

/// A successful result together with the attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    /// The operation's value.
    pub value: T,
    /// The attempt that produced it (1-based).
    pub attempts: u32,
}

/// Runs a fallible async operation under a [`ResiliencePolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryExecutor {
    max_jitter: Duration,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_MAX_JITTER_MS))
    }
}

impl RetryExecutor {
    /// Creates an executor with the given jitter ceiling.
    #[must_use]
    pub fn new(max_jitter: Duration) -> Self {
        Self { max_jitter }
    }

    /// Creates an executor that adds no jitter.
    #[must_use]
    pub fn without_jitter() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Returns the jitter ceiling.
    #[must_use]
    pub fn max_jitter(&self) -> Duration {
        self.max_jitter
    }

    /// Calculates the delay after a failed attempt.
    ///
    /// `delay = base * 2^(attempt-1) + uniform[0, max_jitter)`
    #[must_use]
    pub fn backoff_delay(&self, base: Duration, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).saturating_add(self.jitter())
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..max))
        }
    }

    /// Executes `operation` until it succeeds or the policy is exhausted.
    ///
    /// A timed-out attempt is dropped at its current suspension point and
    /// counted exactly like a rejected one. Work the operation already
    /// handed to a remote service is not recalled, so operations must
    /// tolerate being repeated.
    ///
    /// # Errors
    ///
    /// Returns [`StageExhaustedError`] carrying the last attempt's error
    /// once `max_attempts` attempts have failed.
    pub async fn execute<T, F, Fut, O>(
        &self,
        stage: &str,
        policy: &ResiliencePolicy,
        observer: &O,
        mut operation: F,
    ) -> Result<Attempted<T>, StageExhaustedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
        O: AttemptObserver + ?Sized,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            observer.on_attempt_start(attempt).await;

            let error = match tokio::time::timeout(policy.timeout(), operation()).await {
                Ok(Ok(value)) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    })
                }
                Ok(Err(source)) => AttemptError::rejected(stage, source),
                Err(_) => AttemptError::timeout(stage, policy.timeout_ms),
            };

            if attempt >= max_attempts {
                tracing::warn!(
                    stage = %stage,
                    attempt,
                    error = %error,
                    "Stage attempts exhausted"
                );
                observer.on_attempt_failed(attempt, &error, None).await;
                return Err(StageExhaustedError::new(stage, attempt, error));
            }

            let delay = self.backoff_delay(policy.base_delay(), attempt);
            tracing::debug!(
                stage = %stage,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying after error"
            );
            observer.on_attempt_failed(attempt, &error, Some(delay)).await;

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Start(u32),
        Failed(u32, &'static str, Option<Duration>),
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<Seen>>,
        starts: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl AttemptObserver for RecordingObserver {
        async fn on_attempt_start(&self, attempt: u32) {
            self.events.lock().push(Seen::Start(attempt));
            self.starts.lock().push(Instant::now());
        }

        async fn on_attempt_failed(
            &self,
            attempt: u32,
            error: &AttemptError,
            next_delay: Option<Duration>,
        ) {
            self.events
                .lock()
                .push(Seen::Failed(attempt, error.kind(), next_delay));
        }
    }

    fn policy(max_attempts: u32, base_delay_ms: u64, timeout_ms: u64) -> ResiliencePolicy {
        ResiliencePolicy::new()
            .with_max_attempts(max_attempts)
            .with_base_delay_ms(base_delay_ms)
            .with_timeout_ms(timeout_ms)
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let executor = RetryExecutor::default();
        let base = Duration::from_secs(1);

        for attempt in 1..=4u32 {
            let floor = base * 2u32.pow(attempt - 1);
            let ceiling = floor + Duration::from_millis(DEFAULT_MAX_JITTER_MS);
            for _ in 0..200 {
                let delay = executor.backoff_delay(base, attempt);
                assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
                assert!(delay < ceiling, "attempt {attempt}: {delay:?} >= {ceiling:?}");
            }
        }
    }

    #[test]
    fn test_backoff_without_jitter_is_exact() {
        let executor = RetryExecutor::without_jitter();
        let base = Duration::from_millis(100);

        assert_eq!(executor.backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(executor.backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(executor.backoff_delay(base, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_saturates() {
        let executor = RetryExecutor::without_jitter();
        let delay = executor.backoff_delay(Duration::from_secs(u64::MAX / 2), 40);
        assert_eq!(delay, Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let executor = RetryExecutor::default();
        let observer = RecordingObserver::default();
        let calls = AtomicU32::new(0);

        let result = executor
            .execute("parse", &policy(3, 1000, 5000), &observer, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, StageError>(42) }
            })
            .await
            .unwrap();

        assert_eq!(result, Attempted { value: 42, attempts: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*observer.events.lock(), vec![Seen::Start(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_second_of_three() {
        let executor = RetryExecutor::without_jitter();
        let observer = RecordingObserver::default();
        let calls = AtomicU32::new(0);

        let result = executor
            .execute("embed", &policy(3, 1000, 5000), &observer, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 2 {
                        Err(StageError::rejected("quota exceeded"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *observer.events.lock(),
            vec![
                Seen::Start(1),
                Seen::Failed(1, "StageRejected", Some(Duration::from_secs(1))),
                Seen::Start(2),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_carries_last_error() {
        let executor = RetryExecutor::without_jitter();
        let observer = RecordingObserver::default();
        let calls = AtomicU32::new(0);

        let err = executor
            .execute("persist", &policy(3, 10, 5000), &observer, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err::<(), _>(StageError::rejected(format!("failure {n}"))) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.stage, "persist");
        assert_eq!(err.attempts, 3);
        assert_eq!(err.message(), "Stage 'persist' rejected: failure 3");

        let events = observer.events.lock();
        assert_eq!(events.len(), 6);
        assert_eq!(events[5], Seen::Failed(3, "StageRejected", None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_counts_as_timeout() {
        let executor = RetryExecutor::without_jitter();
        let observer = RecordingObserver::default();
        let start = Instant::now();

        let err = executor
            .execute("score-cv", &policy(2, 100, 1000), &observer, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, StageError>("late answer")
            })
            .await
            .unwrap_err();

        assert!(err.last_error.is_timeout());
        assert_eq!(err.attempts, 2);
        // Two 1s timeouts plus one 100ms backoff; never the 10s completion.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2100));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_success() {
        let executor = RetryExecutor::without_jitter();
        let calls = AtomicU32::new(0);

        let result = executor
            .execute("summarize", &policy(3, 100, 1000), &NoOpObserver, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    Ok::<_, StageError>(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, Attempted { value: 2, attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_observed_delay_between_attempts() {
        let executor = RetryExecutor::default();
        let observer = RecordingObserver::default();
        let base = 1000;

        let _ = executor
            .execute("retrieve-context", &policy(3, base, 5000), &observer, || async {
                Err::<(), _>(StageError::rejected("unavailable"))
            })
            .await;

        let starts = observer.starts.lock();
        assert_eq!(starts.len(), 3);
        for k in 1..3u32 {
            let gap = starts[k as usize] - starts[k as usize - 1];
            let floor = Duration::from_millis(base) * 2u32.pow(k - 1);
            assert!(gap >= floor, "gap {gap:?} below {floor:?}");
            assert!(gap < floor + Duration::from_millis(DEFAULT_MAX_JITTER_MS));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_treated_as_one() {
        let executor = RetryExecutor::without_jitter();
        let calls = AtomicU32::new(0);

        let err = executor
            .execute("x", &policy(0, 10, 100), &NoOpObserver, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StageError::rejected("nope")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
