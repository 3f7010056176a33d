//! The resilient cache client.
//!
//! Every public operation runs the same pipeline:
//!
//! 1. **Readiness**: only a connected client (`Ready`, or `Error` after a failed operation)
//!    accepts work; anything else fails fast with [`CacheError::ClientNotReady`].
//! 2. **Admission**: the circuit breaker, when enabled, admits or rejects the call once.
//!    Rejections return immediately without touching the store or the retry budget.
//! 3. **Execution**: the call runs under the [`Retrier`], bounded by the caller's [`Context`].
//! 4. **Recording**: the single outcome goes to the breaker, the metrics, the health windows and
//!    the client status.
//!
//! A missing key is a normal miss: it counts as a breaker success and is never retried.
//! Cancellation and expired deadlines give the breaker no verdict and release any half-open
//! probe slot they held.
//!
//! The client status, the breaker and the metrics each own their lock; none is taken while
//! another is held.

use crate::backend::CacheBackend;
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{CacheConfig, ConfigError, TtlClass};
use crate::health::HealthChecker;
use crate::metrics::{ClientStats, Metrics, Operation};
use crate::{CacheError, Context, Retrier};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Lifecycle status of a [`ResilientClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// Constructed, not yet connected.
    Initializing,
    /// Connected and the last operation succeeded.
    Ready,
    /// Reconnecting after a failed connect.
    Recovering,
    /// Connected, but the last operation failed. The next success returns to `Ready`.
    Error,
    /// Shut down for good.
    Closed,
}

impl ClientStatus {
    fn accepts_operations(self) -> bool {
        matches!(self, ClientStatus::Ready | ClientStatus::Error)
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ClientStatus::Initializing => "initializing",
            ClientStatus::Ready => "ready",
            ClientStatus::Recovering => "recovering",
            ClientStatus::Error => "error",
            ClientStatus::Closed => "closed",
        })
    }
}

/// A best-effort operation that failed. Logged, returned, and safe to ignore.
#[derive(Debug, thiserror::Error)]
#[error("best-effort {op} of {} key(s) failed: {source}", keys.len())]
pub struct SoftFailure {
    pub op: Operation,
    pub keys: Vec<String>,
    #[source]
    pub source: CacheError,
}

impl SoftFailure {
    pub fn error(&self) -> &CacheError {
        &self.source
    }

    pub fn into_error(self) -> CacheError {
        self.source
    }
}

#[derive(Debug)]
struct ClientState {
    status: ClientStatus,
    last_error: Option<String>,
}

/// How one call ended, from the breaker's point of view.
enum Verdict {
    /// The store answered: a hit, a write, a miss.
    Success,
    /// The store answered with an error that says nothing about its availability.
    Answered,
    /// The store failed or could not be reached.
    Failure,
    /// The caller gave up first.
    Abandoned,
}

fn classify(result: &Result<impl Sized, CacheError>) -> Verdict {
    match result {
        Ok(_) => Verdict::Success,
        Err(err) if err.is_not_found() => Verdict::Success,
        Err(err) if err.is_cancelled() || matches!(err.root(), CacheError::DeadlineExceeded) => {
            Verdict::Abandoned
        }
        Err(err) if err.counts_as_failure() => Verdict::Failure,
        Err(_) => Verdict::Answered,
    }
}

/// Cache client wrapping a [`CacheBackend`] with a circuit breaker, retries, metrics and
/// background health checking.
///
/// Construct one per process and share it by reference or `Arc`; every method takes `&self`.
pub struct ResilientClient {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    breaker: Option<CircuitBreaker>,
    retrier: Retrier,
    metrics: Arc<Metrics>,
    health: Option<HealthChecker>,
    state: RwLock<ClientState>,
    shutdown: CancellationToken,
    sampler: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("status", &self.status())
            .field("backend", &self.backend)
            .field("breaker", &self.breaker.as_ref().map(CircuitBreaker::state))
            .field("retrier", &self.retrier)
            .field("health", &self.health)
            .finish()
    }
}

impl ResilientClient {
    /// Validate `config` and build a client in `Initializing` state. Nothing touches the store
    /// until [`connect`](Self::connect).
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Result<Self, CacheError> {
        Self::with_clock(config, backend, MonotonicClock::default())
    }

    /// Like [`new`](Self::new), with the breaker and health windows reading time from `clock`.
    pub fn with_clock<C: Clock + 'static>(
        config: CacheConfig,
        backend: Arc<dyn CacheBackend>,
        clock: C,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(clock);

        let breaker = config
            .breaker
            .breaker_config()
            .map_err(ConfigError::from)?
            .map(|cfg| CircuitBreaker::with_shared_clock(cfg, clock.clone()));
        let retrier = Retrier::new(&config.retry).map_err(ConfigError::from)?;
        let health = config.health.enabled.then(|| {
            HealthChecker::with_shared_clock(backend.clone(), config.health.clone(), clock.clone())
        });

        Ok(Self {
            config,
            backend,
            breaker,
            retrier,
            metrics: Arc::new(Metrics::new()),
            health,
            state: RwLock::new(ClientState { status: ClientStatus::Initializing, last_error: None }),
            shutdown: CancellationToken::new(),
            sampler: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    /// Build a client backed by Redis at `config.connection`.
    #[cfg(feature = "redis")]
    pub fn connect_redis(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let backend = crate::backend::RedisBackend::new(&config)?;
        Self::new(config, Arc::new(backend))
    }

    /// Replace the retrier, for example to inject a [`Sleeper`](crate::Sleeper).
    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = retrier;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ---- lifecycle ---------------------------------------------------------------------------

    /// Probe the store and start background work.
    ///
    /// On success the client is `Ready`, the health checker runs and the pool sampler runs. On
    /// failure the client is `Error` and the probe error is returned. A second call on a `Ready`
    /// client does nothing. Calling it on an `Error` client reconnects through `Recovering`,
    /// with up to the health check's `max_retries` extra probes. A closed client cannot connect.
    pub async fn connect(&self, ctx: &Context) -> Result<(), CacheError> {
        let _lifecycle = self.lifecycle.lock().await;

        let extra_probes = match self.status() {
            ClientStatus::Ready => return Ok(()),
            ClientStatus::Closed => return Err(CacheError::ClientNotReady(ClientStatus::Closed)),
            ClientStatus::Initializing => 0,
            ClientStatus::Error | ClientStatus::Recovering => {
                self.transition(ClientStatus::Recovering, None);
                self.config.health.max_retries
            }
        };

        if let Err(err) = self.probe(ctx, extra_probes).await {
            let err = err.with_operation(Operation::Ping, "connect");
            self.transition(ClientStatus::Error, Some(&err));
            return Err(err);
        }

        if let Err(err) = self.backend.maintain().await {
            tracing::debug!(error = %err, "initial pool warm-up failed");
        }
        self.metrics.set_pool_stats(self.backend.pool_stats());
        if let Some(health) = &self.health {
            health.start(&self.shutdown);
        }
        self.start_sampler();
        self.transition(ClientStatus::Ready, None);
        Ok(())
    }

    async fn probe(&self, ctx: &Context, extra_probes: u32) -> Result<(), CacheError> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let outcome = ctx.run(self.backend.ping()).await?;
            self.metrics.record(Operation::Ping, started.elapsed(), outcome.is_err());
            match outcome {
                Ok(()) => return Ok(()),
                Err(err) if attempt < extra_probes => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %err, "connect probe failed, retrying");
                    ctx.run(tokio::time::sleep(self.config.health.retry_interval)).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn start_sampler(&self) {
        let mut sampler = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        if sampler.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let backend = self.backend.clone();
        let metrics = self.metrics.clone();
        let token = self.shutdown.child_token();
        let period = self.config.metrics_interval;

        *sampler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
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
                    maintained = backend.maintain() => {
                        if let Err(err) = maintained {
                            tracing::debug!(error = %err, "pool maintenance failed");
                        }
                    }
                }
                let stats = backend.pool_stats();
                tracing::trace!(active = stats.active, idle = stats.idle, "pool sample");
                metrics.set_pool_stats(stats);
            }
        }));
    }

    /// Stop background work, release the pool and mark the client `Closed`.
    ///
    /// Operations already in flight finish with whatever the closed backend returns; new ones
    /// fail fast. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), CacheError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.status() == ClientStatus::Closed {
            return Ok(());
        }
        self.transition(ClientStatus::Closed, None);
        self.shutdown.cancel();

        if let Some(health) = &self.health {
            health.stop().await;
        }
        let sampler = self.sampler.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = sampler {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "pool sampler panicked");
                }
            }
        }
        self.backend.close().await;
        tracing::info!("cache client closed");
        Ok(())
    }

    // ---- status ------------------------------------------------------------------------------

    pub fn status(&self) -> ClientStatus {
        self.state.read().unwrap_or_else(PoisonError::into_inner).status
    }

    /// `true` exactly when the status is `Ready`.
    pub fn is_ready(&self) -> bool {
        self.status() == ClientStatus::Ready
    }

    /// Message of the most recent failure that moved the client to `Error`.
    pub fn last_error(&self) -> Option<String> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).last_error.clone()
    }

    /// The breaker, when enabled.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// The health checker, when enabled.
    pub fn health(&self) -> Option<&HealthChecker> {
        self.health.as_ref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn stats(&self) -> ClientStats {
        let (status, last_error) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            (state.status, state.last_error.clone())
        };
        ClientStats {
            status,
            last_error,
            operations: self.metrics.operations(),
            cache_hits: self.metrics.hits(),
            cache_misses: self.metrics.misses(),
            pool: self.metrics.pool_stats(),
            circuit: self.breaker.as_ref().map(CircuitBreaker::metrics),
            health: self.health.as_ref().map(HealthChecker::status),
        }
    }

    fn transition(&self, to: ClientStatus, err: Option<&CacheError>) {
        if err.is_none() && self.status() == to {
            return;
        }
        let from = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let from = state.status;
            // Closed is terminal; late results from in-flight calls must not reopen it.
            if from == ClientStatus::Closed {
                return;
            }
            state.status = to;
            if let Some(err) = err {
                state.last_error = Some(err.to_string());
            }
            from
        };
        if from == to {
            return;
        }
        match (to, err) {
            (ClientStatus::Error, Some(err)) => {
                tracing::warn!(from = %from, status = %to, error = %err, "cache client status changed")
            }
            _ => tracing::info!(from = %from, status = %to, "cache client status changed"),
        }
    }

    // ---- operation pipeline ------------------------------------------------------------------

    fn ensure_ready(&self, op: Operation, key: &str) -> Result<(), CacheError> {
        let status = self.status();
        if status.accepts_operations() {
            Ok(())
        } else {
            Err(CacheError::ClientNotReady(status).with_operation(op, key))
        }
    }

    async fn execute<T, Fut, Call>(
        &self,
        ctx: &Context,
        op: Operation,
        key: &str,
        call: Call,
    ) -> Result<T, CacheError>
    where
        Call: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        self.ensure_ready(op, key)?;

        let admission = match self.breaker.as_ref().map(CircuitBreaker::allow).transpose() {
            Ok(admission) => admission,
            Err(rejected) => {
                self.metrics.record(op, Duration::ZERO, true);
                tracing::debug!(op = %op, key, error = %rejected, "rejected by circuit breaker");
                let rejected = rejected.with_operation(op, key);
                self.transition(ClientStatus::Error, Some(&rejected));
                return Err(rejected);
            }
        };

        let started = Instant::now();
        let result = ctx.run(self.retrier.attempt_retry(ctx, call)).await.and_then(|r| r);
        let latency = started.elapsed();

        let verdict = classify(&result);
        let failed = !matches!(verdict, Verdict::Success);
        self.metrics.record(op, latency, failed);

        match verdict {
            Verdict::Success | Verdict::Answered => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_success();
                }
                if let Some(health) = &self.health {
                    health.record_operation(latency, true);
                }
            }
            Verdict::Failure => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure();
                }
                if let Some(health) = &self.health {
                    health.record_operation(latency, false);
                }
            }
            Verdict::Abandoned => {
                if let (Some(breaker), Some(admission)) = (&self.breaker, admission) {
                    breaker.release(admission);
                }
            }
        }

        let result = result.map_err(|err| err.with_operation(op, key));
        match (&verdict, &result) {
            (Verdict::Success, _) => self.transition(ClientStatus::Ready, None),
            (Verdict::Abandoned, Err(err)) => {
                tracing::debug!(op = %op, key, error = %err, "cache operation abandoned by caller")
            }
            (_, Err(err)) => self.transition(ClientStatus::Error, Some(err)),
            _ => {}
        }
        result
    }

    // ---- operations --------------------------------------------------------------------------

    /// Look up `key`. Returns `(value, true)` on a hit and `(String::new(), false)` on a miss.
    pub async fn get(&self, ctx: &Context, key: &str) -> Result<(String, bool), CacheError> {
        let backend = &self.backend;
        match self.execute(ctx, Operation::Get, key, || backend.get(key)).await {
            Ok(Some(value)) => {
                self.metrics.record_hit();
                Ok((value, true))
            }
            Ok(None) => {
                self.metrics.record_miss();
                Ok((String::new(), false))
            }
            Err(err) if err.is_not_found() => {
                self.metrics.record_miss();
                Ok((String::new(), false))
            }
            Err(err) => Err(err),
        }
    }

    /// Store `value` under `key` for `ttl`. A zero `ttl` stores without expiry.
    pub async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let backend = &self.backend;
        let ttl = (!ttl.is_zero()).then_some(ttl);
        self.execute(ctx, Operation::Set, key, || backend.set(key, value, ttl)).await
    }

    /// Store `value` with the TTL configured for `class`.
    pub async fn set_with_class(
        &self,
        ctx: &Context,
        key: &str,
        value: &str,
        class: TtlClass,
    ) -> Result<(), CacheError> {
        self.set(ctx, key, value, self.config.ttl.ttl(class)).await
    }

    /// Remove `keys`, returning how many existed.
    pub async fn delete<I, K>(&self, ctx: &Context, keys: I) -> Result<u64, CacheError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        let label = keys.join(",");
        if keys.is_empty() {
            self.ensure_ready(Operation::Delete, &label)?;
            return Ok(0);
        }
        let backend = &self.backend;
        self.execute(ctx, Operation::Delete, &label, || backend.delete(&keys)).await
    }

    /// Round-trip to the store through the full pipeline.
    pub async fn ping(&self, ctx: &Context) -> Result<(), CacheError> {
        let backend = &self.backend;
        self.execute(ctx, Operation::Ping, "", || backend.ping()).await
    }

    /// Look up `key` and decode it as JSON. A payload that does not decode is `InvalidData`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let (raw, found) = self.get(ctx, key).await?;
        if !found {
            return Ok(None);
        }
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            CacheError::InvalidData(e.to_string()).with_operation(Operation::Get, key)
        })
    }

    /// Encode `value` as JSON and store it for `ttl`.
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value).map_err(|e| {
            CacheError::InvalidData(e.to_string()).with_operation(Operation::Set, key)
        })?;
        self.set(ctx, key, &raw, ttl).await
    }

    /// Best-effort delete. A failure is logged and handed back as a [`SoftFailure`] instead of
    /// an error the caller has to act on.
    pub async fn invalidate<I, K>(&self, ctx: &Context, keys: I) -> Result<u64, SoftFailure>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        match self.delete(ctx, &keys).await {
            Ok(removed) => Ok(removed),
            Err(source) => {
                tracing::warn!(op = %Operation::Delete, keys = ?keys, error = %source, "cache invalidation failed");
                Err(SoftFailure { op: Operation::Delete, keys, source })
            }
        }
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
