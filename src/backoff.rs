//! Exponential backoff schedule for retries.
//!
//! Attempt semantics: attempt index `0` is the initial call (no delay); the first retry is
//! `attempt = 1`. The schedule waits `min(initial * factor^(attempt-1), max)`, so the
//! delay after the i-th failure (0-based) is `min(initial * factor^i, max)`.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use shelfcache::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(1)).unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(1)); // capped
//! ```
//!
//! Overflow behavior: computations that overflow or produce non-finite values saturate to the
//! configured maximum.

use std::fmt;
use std::time::Duration;

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError {
    MaxMustBePositive,
    MaxLessThanInitial { initial: Duration, max: Duration },
    FactorBelowOne(f64),
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxMustBePositive => write!(f, "max backoff must be greater than zero"),
            BackoffError::MaxLessThanInitial { initial, max } => {
                write!(f, "max backoff ({:?}) must be >= initial backoff ({:?})", max, initial)
            }
            BackoffError::FactorBelowOne(factor) => {
                write!(f, "backoff factor must be a finite number >= 1.0 (got {})", factor)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    max: Duration,
}

impl Backoff {
    /// Multiplicative backoff starting at `initial`, growing by `factor`, capped at `max`.
    pub fn exponential(initial: Duration, factor: f64, max: Duration) -> Result<Self, BackoffError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(BackoffError::FactorBelowOne(factor));
        }
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < initial {
            return Err(BackoffError::MaxLessThanInitial { initial, max });
        }
        Ok(Self { initial, factor, max })
    }

    /// Calculate the delay before `attempt` (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let nanos = self.initial.as_nanos() as f64 * self.factor.powi(exponent);
        if nanos.is_finite() && nanos < self.max.as_nanos() as f64 {
            // `as` saturates, so the cast cannot wrap.
            Duration::from_nanos(nanos.round() as u64)
        } else {
            self.max
        }
    }
}
