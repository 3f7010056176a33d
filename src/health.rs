//! Background health checking of the backing store.
//!
//! A loop pings the store every `interval`. A ping is bounded by `timeout` and retried up to
//! `max_retries` times, `retry_interval` apart, before the check counts as failed. Each check
//! updates the consecutive success/failure counts. Ping latencies and the outcomes of every
//! check and foreground operation feed two sliding [`TimeWindow`]s, which yield the average
//! latency and the error rate.
//!
//! The store is **healthy** while consecutive failed checks stay below `failure_threshold`, the
//! error rate stays at or below `max_error_rate` and the average latency at or below
//! `max_latency`. A healthy store is **degraded** when the error rate is above zero or the pool
//! holds fewer idle connections than `min_idle_conns`.
//!
//! Health failures are logged and folded into [`HealthStatus`]; they never reach foreground
//! callers as errors.

use crate::backend::CacheBackend;
use crate::clock::{Clock, MonotonicClock};
use crate::config::HealthCheckConfig;
use crate::pool::PoolStats;
use crate::{CacheError, TimeWindow};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use crate::config::HealthThresholds;

/// Derived health of the backing store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub degraded: bool,
    /// Wall-clock time of the last completed check.
    pub last_check: Option<SystemTime>,
    pub last_error: Option<String>,
    pub consecutive_ok: u32,
    pub consecutive_failures: u32,
    /// Completed checks since construction.
    pub checks: u64,
    pub avg_latency: Option<Duration>,
    /// Failed samples over all samples in the window, `0.0` when empty.
    pub error_rate: f64,
    pub idle_conns: usize,
    pub message: String,
}

#[derive(Debug)]
struct HealthState {
    latencies: TimeWindow,
    outcomes: TimeWindow,
    consecutive_ok: u32,
    consecutive_failures: u32,
    checks: u64,
    last_check: Option<SystemTime>,
    last_error: Option<String>,
    was_healthy: bool,
    was_degraded: bool,
}

struct Shared {
    backend: Arc<dyn CacheBackend>,
    config: HealthCheckConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<HealthState>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic pinger plus the windows foreground operations report into.
pub struct HealthChecker {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(d: Duration) -> f64 {
    d.as_micros() as f64 / 1000.0
}

impl HealthChecker {
    pub fn new(backend: Arc<dyn CacheBackend>, config: HealthCheckConfig) -> Self {
        Self::with_shared_clock(backend, config, Arc::new(MonotonicClock::default()))
    }

    /// Use a custom clock for the sliding windows.
    pub fn with_clock<C: Clock + 'static>(
        backend: Arc<dyn CacheBackend>,
        config: HealthCheckConfig,
        clock: C,
    ) -> Self {
        Self::with_shared_clock(backend, config, Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(
        backend: Arc<dyn CacheBackend>,
        config: HealthCheckConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let window = config.thresholds.window;
        let state = HealthState {
            latencies: TimeWindow::new(window),
            outcomes: TimeWindow::new(window),
            consecutive_ok: 0,
            consecutive_failures: 0,
            checks: 0,
            last_check: None,
            last_error: None,
            was_healthy: true,
            was_degraded: false,
        };
        Self {
            shared: Arc::new(Shared { backend, config, clock, state: Mutex::new(state) }),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.shared.config
    }

    /// Spawn the check loop as a child of `parent`. No-op while a loop is already running.
    pub fn start(&self, parent: &CancellationToken) {
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }
        let token = parent.child_token();
        let shared = self.shared.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { shared.run(loop_token).await });
        tracing::debug!(interval_ms = millis(self.shared.config.interval), "health checker started");
        *running = Some(Running { token, handle });
    }

    /// Stop the loop and wait for it to exit. Safe to call when never started or already stopped.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        if let Some(Running { token, handle }) = running {
            token.cancel();
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "health check loop panicked");
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one check right away and return the resulting status.
    pub async fn check_now(&self) -> HealthStatus {
        self.shared.check().await
    }

    /// Feed the outcome of a foreground operation into the windows.
    pub fn record_operation(&self, latency: Duration, ok: bool) {
        let now = self.shared.clock.now_millis();
        let mut state = lock(&self.shared.state);
        if ok {
            state.latencies.record(now, millis(latency));
        }
        state.outcomes.record(now, if ok { 0.0 } else { 1.0 });
    }

    pub fn status(&self) -> HealthStatus {
        self.shared.status()
    }
}

impl Shared {
    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; connect has just probed the store.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                status = self.check() => {
                    tracing::trace!(healthy = status.healthy, degraded = status.degraded, "health check");
                }
            }
        }
        tracing::debug!("health checker stopped");
    }

    async fn ping_once(&self) -> Result<Duration, CacheError> {
        let started = Instant::now();
        match tokio::time::timeout(self.config.timeout, self.backend.ping()).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CacheError::Timeout(self.config.timeout)),
        }
    }

    async fn check(&self) -> HealthStatus {
        let mut retries = 0;
        let outcome = loop {
            match self.ping_once().await {
                Ok(latency) => break Ok(latency),
                Err(err) if retries < self.config.max_retries => {
                    retries += 1;
                    tracing::debug!(attempt = retries, error = %err, "health ping failed, retrying");
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                Err(err) => break Err(err),
            }
        };
        self.record_check(outcome)
    }

    fn record_check(&self, outcome: Result<Duration, CacheError>) -> HealthStatus {
        let pool = self.backend.pool_stats();
        let now = self.clock.now_millis();
        let (status, became_unhealthy, recovered, became_degraded) = {
            let mut state = lock(&self.state);
            state.checks += 1;
            state.last_check = Some(SystemTime::now());
            match &outcome {
                Ok(latency) => {
                    state.consecutive_ok += 1;
                    state.consecutive_failures = 0;
                    state.latencies.record(now, millis(*latency));
                    state.outcomes.record(now, 0.0);
                }
                Err(err) => {
                    state.consecutive_failures += 1;
                    state.consecutive_ok = 0;
                    state.last_error = Some(err.to_string());
                    state.outcomes.record(now, 1.0);
                }
            }

            let status = self.evaluate(&mut state, &pool, now);
            let became_unhealthy = state.was_healthy && !status.healthy;
            let recovered = !state.was_healthy && status.healthy;
            let became_degraded = !state.was_degraded && status.degraded;
            state.was_healthy = status.healthy;
            state.was_degraded = status.degraded;
            (status, became_unhealthy, recovered, became_degraded)
        };

        if let Err(err) = &outcome {
            tracing::warn!(error = %err, "health check failed");
        }
        if became_unhealthy {
            tracing::warn!(
                consecutive_failures = status.consecutive_failures,
                error_rate = status.error_rate,
                message = %status.message,
                "backing store unhealthy"
            );
        } else if recovered {
            tracing::info!(message = %status.message, "backing store healthy again");
        }
        if became_degraded {
            tracing::info!(message = %status.message, "backing store degraded");
        }
        status
    }

    fn status(&self) -> HealthStatus {
        let pool = self.backend.pool_stats();
        let now = self.clock.now_millis();
        let mut state = lock(&self.state);
        self.evaluate(&mut state, &pool, now)
    }

    /// Classify the current windows. Pruning aside, leaves `state` untouched.
    fn evaluate(&self, state: &mut HealthState, pool: &PoolStats, now: u64) -> HealthStatus {
        let thresholds = &self.config.thresholds;
        let error_rate = state.outcomes.mean(now).unwrap_or(0.0);
        let avg_latency_ms = state.latencies.mean(now);

        let mut problems = Vec::new();
        if state.consecutive_failures >= thresholds.failure_threshold {
            problems.push(format!("{} consecutive failed checks", state.consecutive_failures));
        }
        if error_rate > thresholds.max_error_rate {
            problems.push(format!(
                "error rate {:.1}% above {:.1}%",
                error_rate * 100.0,
                thresholds.max_error_rate * 100.0
            ));
        }
        if let Some(avg) = avg_latency_ms {
            if avg > millis(thresholds.max_latency) {
                problems.push(format!(
                    "average latency {:.1}ms above {}ms",
                    avg,
                    thresholds.max_latency.as_millis()
                ));
            }
        }
        let healthy = problems.is_empty();

        // A backend without a pool reports max_active == 0; the idle floor does not apply.
        let idle_short = pool.max_active > 0 && pool.idle < thresholds.min_idle_conns;
        let mut warnings = Vec::new();
        if healthy && error_rate > 0.0 {
            warnings.push(format!("error rate {:.1}%", error_rate * 100.0));
        }
        if healthy && idle_short {
            warnings.push(format!(
                "{} idle connections (min {})",
                pool.idle, thresholds.min_idle_conns
            ));
        }
        let degraded = !warnings.is_empty();

        let message = if !healthy {
            format!("unhealthy: {}", problems.join(", "))
        } else if degraded {
            format!("degraded: {}", warnings.join(", "))
        } else {
            "healthy".to_string()
        };

        HealthStatus {
            healthy,
            degraded,
            last_check: state.last_check,
            last_error: state.last_error.clone(),
            consecutive_ok: state.consecutive_ok,
            consecutive_failures: state.consecutive_failures,
            checks: state.checks,
            avg_latency: avg_latency_ms.map(|ms| Duration::from_micros((ms * 1000.0).round() as u64)),
            error_rate,
            idle_conns: pool.idle,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Fault, MemoryBackend};
    use crate::metrics::Operation;
    use crate::ManualClock;

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(200),
            max_retries: 0,
            retry_interval: Duration::from_millis(100),
            thresholds: HealthThresholds {
                max_latency: Duration::from_millis(500),
                max_error_rate: 0.5,
                min_idle_conns: 1,
                failure_threshold: 3,
                window: Duration::from_secs(60),
            },
        }
    }

    fn checker(config: HealthCheckConfig) -> (HealthChecker, Arc<MemoryBackend>, ManualClock) {
        let backend = Arc::new(MemoryBackend::new());
        let clock = ManualClock::new();
        (HealthChecker::with_clock(backend.clone(), config, clock.clone()), backend, clock)
    }

    #[tokio::test]
    async fn fresh_checker_is_healthy() {
        let (checker, _, _) = checker(config());
        let status = checker.status();
        assert!(status.healthy);
        assert!(!status.degraded);
        assert_eq!(status.checks, 0);
        assert_eq!(status.message, "healthy");
    }

    #[tokio::test]
    async fn successful_check_counts_and_records_latency() {
        let (checker, backend, _) = checker(config());
        let status = checker.check_now().await;
        assert!(status.healthy);
        assert_eq!(status.consecutive_ok, 1);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.avg_latency.is_some());
        assert!(status.last_check.is_some());
        assert_eq!(backend.calls(Operation::Ping), 1);
    }

    #[tokio::test]
    async fn consecutive_failures_make_the_store_unhealthy() {
        let mut cfg = config();
        cfg.thresholds.max_error_rate = 1.0;
        let (checker, backend, _) = checker(cfg);
        backend.set_offline(true);

        assert!(checker.check_now().await.healthy);
        assert!(checker.check_now().await.healthy);
        let status = checker.check_now().await;
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 3);
        assert!(status.message.contains("3 consecutive failed checks"), "{}", status.message);
        assert!(status.last_error.is_some());

        backend.set_offline(false);
        let status = checker.check_now().await;
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.consecutive_ok, 1);
        assert!(status.healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn a_check_retries_failed_pings() {
        let (checker, backend, _) = checker(HealthCheckConfig { max_retries: 3, ..config() });
        backend.fail_next(2, Fault::Timeout);

        let status = checker.check_now().await;
        assert_eq!(status.consecutive_ok, 1);
        assert_eq!(backend.calls(Operation::Ping), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ping_times_out() {
        let (checker, backend, _) = checker(config());
        backend.set_latency(Duration::from_secs(1));
        let status = checker.check_now().await;
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn error_rate_degrades_then_fails() {
        let (checker, _, _) = checker(config());
        for _ in 0..3 {
            checker.record_operation(Duration::from_millis(1), true);
        }
        checker.record_operation(Duration::from_millis(1), false);
        let status = checker.status();
        assert!(status.healthy);
        assert!(status.degraded);
        assert_eq!(status.error_rate, 0.25);

        for _ in 0..4 {
            checker.record_operation(Duration::from_millis(1), false);
        }
        let status = checker.status();
        assert!(!status.healthy);
        assert!(status.message.starts_with("unhealthy: error rate"), "{}", status.message);
    }

    #[tokio::test]
    async fn high_average_latency_is_unhealthy() {
        let (checker, _, _) = checker(config());
        checker.record_operation(Duration::from_millis(900), true);
        checker.record_operation(Duration::from_millis(300), true);
        let status = checker.status();
        assert!(!status.healthy);
        assert_eq!(status.avg_latency, Some(Duration::from_millis(600)));
    }

    #[tokio::test]
    async fn samples_age_out_of_the_window() {
        let (checker, _, clock) = checker(config());
        for _ in 0..10 {
            checker.record_operation(Duration::from_millis(1), false);
        }
        assert!(!checker.status().healthy);
        clock.advance(61_000);
        let status = checker.status();
        assert!(status.healthy);
        assert_eq!(status.error_rate, 0.0);
    }

    #[tokio::test]
    async fn too_few_idle_connections_is_degraded() {
        let (checker, backend, _) = checker(config());
        backend.set_pool_stats(PoolStats { max_active: 10, idle: 0, ..PoolStats::default() });
        let status = checker.status();
        assert!(status.healthy);
        assert!(status.degraded);
        assert!(status.message.contains("0 idle connections"), "{}", status.message);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_pings_on_interval_until_stopped() {
        let (checker, backend, _) = checker(config());
        checker.stop().await;

        let root = CancellationToken::new();
        checker.start(&root);
        checker.start(&root);
        assert!(checker.is_running());

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(backend.calls(Operation::Ping), 3);

        checker.stop().await;
        checker.stop().await;
        assert!(!checker.is_running());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.calls(Operation::Ping), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_ends_the_loop() {
        let (checker, backend, _) = checker(config());
        let root = CancellationToken::new();
        checker.start(&root);
        root.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!checker.is_running());
        assert_eq!(backend.calls(Operation::Ping), 0);
    }

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
        type Writer = SharedWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn reading_status_never_logs_transitions() {
        let writer = SharedWriter::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer.clone())
            .with_ansi(false)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);
        let logs = || String::from_utf8(writer.0.lock().unwrap().clone()).unwrap();

        let (checker, backend, _) = checker(config());
        for _ in 0..3 {
            checker.record_operation(Duration::from_millis(1), false);
        }
        for _ in 0..3 {
            assert!(!checker.status().healthy);
        }
        assert!(!logs().contains("backing store unhealthy"), "logs: {}", logs());

        backend.set_offline(true);
        checker.check_now().await;
        checker.check_now().await;
        assert_eq!(logs().matches("backing store unhealthy").count(), 1, "logs: {}", logs());
    }
}
