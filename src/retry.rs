//! Retry loop for cache operations.
//!
//! Semantics:
//! - `max_retries` counts retries on top of the initial call, so an operation that always fails
//!   runs `max_retries + 1` times and the last error is returned.
//! - Only errors accepted by the `should_retry` predicate are retried (by default transport
//!   errors: connection failures and store timeouts). Everything else returns immediately.
//! - Between attempts the loop waits `min(initial * factor^i, max)` (optionally jittered) while
//!   watching the caller's [`Context`]; cancellation or an expired deadline during the wait ends
//!   the loop with the context error and no further attempt.
//!
//! The retrier knows nothing about the circuit breaker. The client composes the two around the
//! same operation closure: admission first, then this loop, then a single outcome record.
//!
//! Example
//! ```rust
//! use shelfcache::{CacheError, Context, Retrier, RetryPolicy, InstantSleeper};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let retrier = Retrier::new(&RetryPolicy::default()).unwrap().with_sleeper(InstantSleeper);
//! let result: Result<(), CacheError> = retrier
//!     .attempt_retry(&Context::background(), || async {
//!         Err(CacheError::ConnectionFailed("refused".into()))
//!     })
//!     .await;
//! assert!(result.is_err());
//! # });
//! ```

use crate::backoff::BackoffError;
use crate::{Backoff, CacheError, Context, Jitter, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry settings: how many retries and how far apart.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Multiplier applied to the backoff after each retry.
    pub factor: f64,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            factor: 2.0,
            jitter: Jitter::None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// The backoff schedule described by this policy.
    pub fn backoff(&self) -> Result<Backoff, BackoffError> {
        Backoff::exponential(self.initial_backoff, self.factor, self.max_backoff)
    }
}

type RetryPredicate = Arc<dyn Fn(&CacheError) -> bool + Send + Sync>;

/// Executes an operation under a [`RetryPolicy`].
#[derive(Clone)]
pub struct Retrier {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: RetryPredicate,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl Retrier {
    /// Build a retrier, validating the backoff parameters.
    pub fn new(policy: &RetryPolicy) -> Result<Self, BackoffError> {
        Ok(Self {
            max_retries: policy.max_retries,
            backoff: policy.backoff()?,
            jitter: policy.jitter,
            should_retry: Arc::new(CacheError::is_retryable),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Replace the predicate that decides whether an error is worth another attempt.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CacheError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, runs out of retries,
    /// or `ctx` is done.
    pub async fn attempt_retry<T, Fut, Op>(&self, ctx: &Context, mut operation: Op) -> Result<T, CacheError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let mut retries: u32 = 0;
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(self.should_retry)(&err) {
                return Err(err);
            }
            if retries >= self.max_retries {
                if self.max_retries > 0 {
                    tracing::warn!(attempts = retries + 1, error = %err, "retries exhausted");
                }
                return Err(err);
            }

            retries += 1;
            let delay = self.jitter.apply(self.backoff.delay(retries as usize));
            tracing::debug!(
                attempt = retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retrying cache operation"
            );

            tokio::select! {
                biased;
                cancelled = ctx.done() => return Err(cancelled),
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            factor: 2.0,
            jitter: Jitter::None,
        }
    }

    fn timeout() -> CacheError {
        CacheError::Timeout(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn success_on_first_attempt_runs_once() {
        let retrier = Retrier::new(&policy(3)).unwrap().with_sleeper(InstantSleeper);
        let calls = AtomicUsize::new(0);

        let result = retrier
            .attempt_retry(&Context::background(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "Should only execute once");
    }

    #[tokio::test]
    async fn success_after_transient_failures() {
        let retrier = Retrier::new(&policy(5)).unwrap().with_sleeper(InstantSleeper);
        let calls = AtomicUsize::new(0);

        let result = retrier
            .attempt_retry(&Context::background(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(timeout())
                } else {
                    Ok("value")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "value");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_runs_max_retries_plus_one_and_returns_last_error() {
        let retrier = Retrier::new(&policy(3)).unwrap().with_sleeper(InstantSleeper);
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = retrier
            .attempt_retry(&Context::background(), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(CacheError::ConnectionFailed(format!("attempt {}", n)))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            CacheError::ConnectionFailed(msg) => assert_eq!(msg, "attempt 3"),
            other => panic!("expected last connection error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        let sleeper = TrackingSleeper::new();
        let retrier = Retrier::new(&policy(4)).unwrap().with_sleeper(sleeper.clone());

        let _ = retrier
            .attempt_retry(&Context::background(), || async { Err::<(), _>(timeout()) })
            .await;

        assert_eq!(
            sleeper.calls(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let sleeper = TrackingSleeper::new();
        let retrier = Retrier::new(&policy(5)).unwrap().with_sleeper(sleeper.clone());
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = retrier
            .attempt_retry(&Context::background(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CacheError::InvalidData("not json".into()))
            })
            .await;

        assert!(matches!(result, Err(CacheError::InvalidData(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn custom_predicate_overrides_default() {
        let retrier = Retrier::new(&policy(2))
            .unwrap()
            .with_sleeper(InstantSleeper)
            .should_retry(|_| false);
        let calls = AtomicUsize::new(0);

        let _ = retrier
            .attempt_retry(&Context::background(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(timeout())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_returns_context_error() {
        let slow = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
            ..policy(10)
        };
        let retrier = Retrier::new(&slow).unwrap();
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let calls = AtomicUsize::new(0);
        let start = tokio::time::Instant::now();
        let result: Result<(), _> = retrier
            .attempt_retry(&ctx, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(timeout())
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no attempt after cancellation");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_backoff_is_a_timeout() {
        let retrier = Retrier::new(&RetryPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
            ..policy(3)
        })
        .unwrap();
        let ctx = Context::background().with_timeout(Duration::from_millis(200));

        let result: Result<(), _> =
            retrier.attempt_retry(&ctx, || async { Err(timeout()) }).await;

        assert!(matches!(result, Err(CacheError::DeadlineExceeded)));
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let bad = RetryPolicy { factor: 0.0, ..RetryPolicy::default() };
        assert!(Retrier::new(&bad).is_err());
    }
}
