//! Circuit breaker guarding the backing store.
//!
//! ```text
//! +--------+   consecutive failures >= max   +------+
//! | Closed | ------------------------------> | Open |
//! +--------+                                 +------+
//!     ^                                       |    ^
//!     | success          now - last failure   |    | any failure
//!     |                  > reset timeout      v    |
//!     +---------------------------------  +-----------+
//!                                         | Half-Open |  at most N probes admitted
//!                                         +-----------+
//! ```
//!
//! All counters and the state live behind one mutex, so a transition is atomic with the counter
//! update that caused it. Concurrent `record_failure` calls are serialized and the threshold is
//! never over- or under-counted. The breaker does not run the operation itself: callers ask
//! [`CircuitBreaker::allow`], do the work, then report the outcome.

use crate::clock::{Clock, MonotonicClock};
use crate::CacheError;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Rejects calls until the reset timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    max_failures: u32,
    reset_timeout: Duration,
    half_open_max_requests: u32,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    InvalidMaxFailures(u32),
    /// Reset timeout must be > 0.
    InvalidResetTimeout(Duration),
    /// Half-open probe limit must be > 0.
    InvalidHalfOpenLimit(u32),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidMaxFailures(n) => {
                write!(f, "max_failures must be > 0 (got {})", n)
            }
            CircuitBreakerError::InvalidResetTimeout(timeout) => {
                write!(f, "reset_timeout must be > 0 (got {:?})", timeout)
            }
            CircuitBreakerError::InvalidHalfOpenLimit(n) => {
                write!(f, "half_open_max_requests must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        max_failures: u32,
        reset_timeout: Duration,
        half_open_max_requests: u32,
    ) -> Result<Self, CircuitBreakerError> {
        if max_failures == 0 {
            return Err(CircuitBreakerError::InvalidMaxFailures(max_failures));
        }
        if reset_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidResetTimeout(reset_timeout));
        }
        if half_open_max_requests == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit(half_open_max_requests));
        }
        Ok(Self { max_failures, reset_timeout, half_open_max_requests })
    }

    /// Consecutive failures before opening from Closed.
    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Time since the last failure before an Open breaker admits a probe.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Maximum concurrent probes while Half-Open.
    pub fn half_open_max_requests(&self) -> u32 {
        self.half_open_max_requests
    }
}

/// Point-in-time snapshot of breaker state and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    /// Calls refused while Open or saturated Half-Open.
    pub rejected: u64,
    pub half_open_in_flight: u32,
    pub since_last_failure: Option<Duration>,
    pub since_last_success: Option<Duration>,
    pub since_state_change: Duration,
}

/// Proof that [`CircuitBreaker::allow`] admitted a call.
///
/// A probe admitted while Half-Open remembers which Half-Open period it belongs to, so
/// [`CircuitBreaker::release`] only hands back slots the call actually holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    half_open_generation: Option<u64>,
}

impl Admission {
    /// `true` when the call was admitted as a Half-Open probe.
    pub fn is_probe(&self) -> bool {
        self.half_open_generation.is_some()
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    consecutive_failures: u64,
    total_failures: u64,
    total_successes: u64,
    rejected: u64,
    half_open_in_flight: u32,
    last_failure_ms: Option<u64>,
    last_success_ms: Option<u64>,
    last_state_change_ms: u64,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState, now: u64) {
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.half_open_in_flight = 0;
        self.last_state_change_ms = now;
    }
}

/// Three-state circuit breaker.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and affect the same
/// circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<BreakerState>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker from a validated config.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, MonotonicClock::default())
    }

    /// Create a breaker reading time from `clock` (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(config: CircuitBreakerConfig, clock: C) -> Self {
        Self::with_shared_clock(config, Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        let state = BreakerState {
            state: CircuitState::Closed,
            generation: 0,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            rejected: 0,
            half_open_in_flight: 0,
            last_failure_ms: None,
            last_success_ms: None,
            last_state_change_ms: now,
        };
        Self { state: Arc::new(Mutex::new(state)), config, clock }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset_timeout_millis(&self) -> u64 {
        u64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Decide whether a call may proceed.
    ///
    /// - **Closed**: always admits.
    /// - **Open**: rejects with [`CacheError::CircuitOpen`] until more than `reset_timeout` has
    ///   passed since the last failure, then moves to Half-Open and admits this call as a probe.
    /// - **Half-Open**: admits up to `half_open_max_requests` probes, then rejects with
    ///   [`CacheError::CircuitHalfOpenSaturated`].
    pub fn allow(&self) -> Result<Admission, CacheError> {
        let now = self.clock.now_millis();
        let mut s = self.lock();

        match s.state {
            CircuitState::Closed => Ok(Admission { half_open_generation: None }),
            CircuitState::Open => {
                let since_failure =
                    now.saturating_sub(s.last_failure_ms.unwrap_or(s.last_state_change_ms));
                if since_failure > self.reset_timeout_millis() {
                    s.transition(CircuitState::HalfOpen, now);
                    s.half_open_in_flight = 1;
                    tracing::info!("Circuit breaker → half-open");
                    Ok(Admission { half_open_generation: Some(s.generation) })
                } else {
                    s.rejected += 1;
                    Err(CacheError::CircuitOpen {
                        failures: s.consecutive_failures,
                        open_for: Duration::from_millis(now.saturating_sub(s.last_state_change_ms)),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if s.half_open_in_flight < self.config.half_open_max_requests {
                    s.half_open_in_flight += 1;
                    tracing::debug!(
                        in_flight = s.half_open_in_flight,
                        max = self.config.half_open_max_requests,
                        "Circuit breaker: half-open probe admitted"
                    );
                    Ok(Admission { half_open_generation: Some(s.generation) })
                } else {
                    s.rejected += 1;
                    Err(CacheError::CircuitHalfOpenSaturated {
                        in_flight: s.half_open_in_flight,
                        limit: self.config.half_open_max_requests,
                    })
                }
            }
        }
    }

    /// Record a successful call. Closes a Half-Open breaker.
    ///
    /// Any success resets the consecutive-failure streak, so only uninterrupted failures trip the
    /// breaker.
    pub fn record_success(&self) {
        let now = self.clock.now_millis();
        let mut s = self.lock();
        s.consecutive_failures = 0;
        s.total_successes += 1;
        s.last_success_ms = Some(now);

        if s.state == CircuitState::HalfOpen {
            s.transition(CircuitState::Closed, now);
            tracing::info!("Circuit breaker → closed");
        }
    }

    /// Record a failed call. Opens a Closed breaker at the threshold and re-opens a Half-Open one
    /// on any failure.
    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        let mut s = self.lock();
        s.consecutive_failures += 1;
        s.total_failures += 1;
        s.last_failure_ms = Some(now);
        let failures = s.consecutive_failures;

        match s.state {
            CircuitState::Closed if failures >= u64::from(self.config.max_failures) => {
                s.transition(CircuitState::Open, now);
                tracing::error!(
                    failures,
                    threshold = self.config.max_failures,
                    "Circuit breaker → open"
                );
            }
            CircuitState::HalfOpen => {
                s.transition(CircuitState::Open, now);
                tracing::warn!(failures, "Circuit breaker: probe failed → open");
            }
            _ => {}
        }
    }

    /// Give back the half-open probe slot held by a call that finished without a verdict
    /// (for example, the caller cancelled it).
    ///
    /// Calls admitted while Closed, or during an earlier Half-Open period, hold no slot and
    /// release nothing.
    pub fn release(&self, admission: Admission) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen && admission.half_open_generation == Some(s.generation)
        {
            s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Force the breaker closed and clear the failure streak.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut s = self.lock();
        s.consecutive_failures = 0;
        if s.state != CircuitState::Closed {
            s.transition(CircuitState::Closed, now);
            tracing::info!("Circuit breaker reset → closed");
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let now = self.clock.now_millis();
        let s = self.lock();
        let since = |at: u64| Duration::from_millis(now.saturating_sub(at));
        CircuitMetrics {
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            total_failures: s.total_failures,
            total_successes: s.total_successes,
            rejected: s.rejected,
            half_open_in_flight: s.half_open_in_flight,
            since_last_failure: s.last_failure_ms.map(since),
            since_last_success: s.last_success_ms.map(since),
            since_state_change: since(s.last_state_change_ms),
        }
    }
}
