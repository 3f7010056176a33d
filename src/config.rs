//! Typed configuration for the cache client.
//!
//! Every section has a `Default` with production-sane values. [`CacheConfig::from_env`] layers
//! `SHELFCACHE_*` environment variables on top of the defaults and validates the result.
//! Durations are given in milliseconds (`*_MS`). A value that does not parse is an error naming
//! the variable; it is never silently ignored.

use crate::backoff::BackoffError;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::{Jitter, RetryPolicy};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

const ENV_PREFIX: &str = "SHELFCACHE_";

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },
    /// Port outside 1..=65535 and no URL to fall back on
    #[error("port must be in 1..=65535 when no url is given (got {0})")]
    InvalidPort(u32),
    #[error("pool max_active ({max_active}) must be >= max_idle ({max_idle})")]
    MaxActiveBelowMaxIdle { max_active: usize, max_idle: usize },
    #[error("pool min_idle ({min_idle}) must be <= max_idle ({max_idle})")]
    MinIdleAboveMaxIdle { min_idle: usize, max_idle: usize },
    #[error("pool max_active must be > 0")]
    EmptyPool,
    #[error("pool max_active ({max_active}) exceeds the limit of {limit}")]
    PoolTooLarge { max_active: usize, limit: usize },
    /// A timeout that must be positive was zero
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("circuit breaker: {0}")]
    Breaker(CircuitBreakerError),
    #[error("retry: {0}")]
    Retry(BackoffError),
    #[error("health check: {0}")]
    Health(&'static str),
}

impl From<CircuitBreakerError> for ConfigError {
    fn from(err: CircuitBreakerError) -> Self {
        ConfigError::Breaker(err)
    }
}

impl From<BackoffError> for ConfigError {
    fn from(err: BackoffError) -> Self {
        ConfigError::Retry(err)
    }
}

/// Where the backing store lives.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Full connection URL; when set it wins over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u32,
    pub password: Option<String>,
    pub db: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { url: None, host: "localhost".into(), port: 6379, password: None, db: 0 }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .finish()
    }
}

impl ConnectionConfig {
    /// Connection URL in `redis://[:password@]host:port/db` form.
    pub fn url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db)
            }
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Connection pool sizing and expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections kept warm by pool maintenance.
    pub min_idle: usize,
    pub max_idle: usize,
    /// Upper bound on connections checked out at once.
    pub max_active: usize,
    /// Idle connections unused for longer are closed. `None` keeps them forever.
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are closed. `None` means no limit.
    pub max_lifetime: Option<Duration>,
    /// How long a caller waits for a free connection.
    pub pool_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_idle: 10,
            max_active: 50,
            idle_timeout: Some(Duration::from_secs(300)),
            max_lifetime: Some(Duration::from_secs(3600)),
            pool_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-call network timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub dial: Duration,
    /// Applied to GET and PING.
    pub read: Duration,
    /// Applied to SET and DEL.
    pub write: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(5),
            read: Duration::from_secs(3),
            write: Duration::from_secs(3),
        }
    }
}

/// Circuit breaker settings as configured; see [`BreakerSettings::breaker_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub half_open_requests: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_requests: 3,
        }
    }
}

impl BreakerSettings {
    /// Validated breaker configuration, `None` when the breaker is disabled.
    pub fn breaker_config(&self) -> Result<Option<CircuitBreakerConfig>, CircuitBreakerError> {
        if !self.enabled {
            return Ok(None);
        }
        CircuitBreakerConfig::new(self.max_failures, self.reset_timeout, self.half_open_requests)
            .map(Some)
    }
}

/// Limits the health checker compares its windows against.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Mean ping latency over the window above which the store is unhealthy.
    pub max_latency: Duration,
    /// Fraction of failed samples over the window above which the store is unhealthy.
    pub max_error_rate: f64,
    /// Fewer idle pooled connections than this marks the store degraded.
    pub min_idle_conns: usize,
    /// Consecutive failed checks that make the store unhealthy.
    pub failure_threshold: u32,
    /// Span of the latency and error-rate windows.
    pub window: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_millis(500),
            max_error_rate: 0.1,
            min_idle_conns: 1,
            failure_threshold: 3,
            window: Duration::from_secs(300),
        }
    }
}

/// Background health checking.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Bound on a single ping.
    pub timeout: Duration,
    /// Extra pings after a failed one, within the same check.
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub thresholds: HealthThresholds,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Cached object categories with their own expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TtlClass {
    /// Paginated listings; change often.
    ListPage,
    /// Single-item detail pages.
    DetailPage,
    /// Pages assembled from several sources.
    AggregatePage,
    Default,
}

/// TTL table keyed by [`TtlClass`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlConfig {
    pub list_page: Duration,
    pub detail_page: Duration,
    pub aggregate_page: Duration,
    pub default: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            list_page: Duration::from_secs(5 * 60),
            detail_page: Duration::from_secs(15 * 60),
            aggregate_page: Duration::from_secs(10 * 60),
            default: Duration::from_secs(10 * 60),
        }
    }
}

impl TtlConfig {
    pub fn ttl(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::ListPage => self.list_page,
            TtlClass::DetailPage => self.detail_page,
            TtlClass::AggregatePage => self.aggregate_page,
            TtlClass::Default => self.default,
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub connection: ConnectionConfig,
    pub pool: PoolConfig,
    pub timeouts: TimeoutConfig,
    pub breaker: BreakerSettings,
    pub health: HealthCheckConfig,
    pub retry: RetryPolicy,
    /// Period of the pool maintenance and gauge sampler.
    pub metrics_interval: Duration,
    pub ttl: TtlConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            pool: PoolConfig::default(),
            timeouts: TimeoutConfig::default(),
            breaker: BreakerSettings::default(),
            health: HealthCheckConfig::default(),
            retry: RetryPolicy::default(),
            metrics_interval: Duration::from_secs(30),
            ttl: TtlConfig::default(),
        }
    }
}

/// Typed reads of `SHELFCACHE_*` variables through a lookup function.
struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var = format!("{}{}", ENV_PREFIX, name);
        (self.lookup)(&var).map(|value| (var, value))
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.raw(name) {
            None => Ok(None),
            Some((var, value)) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue { var, value }),
        }
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).map(|(_, value)| value)
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    /// Milliseconds where `0` disables the limit.
    fn optional_millis(&self, name: &str) -> Result<Option<Option<Duration>>, ConfigError> {
        Ok(self.millis(name)?.map(|d| (!d.is_zero()).then_some(d)))
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        match self.raw(name) {
            None => Ok(None),
            Some((var, value)) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidValue { var, value }),
            },
        }
    }

    fn jitter(&self, name: &str) -> Result<Option<Jitter>, ConfigError> {
        match self.raw(name) {
            None => Ok(None),
            Some((var, value)) => Jitter::from_name(&value)
                .map(Some)
                .ok_or(ConfigError::InvalidValue { var, value }),
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

impl CacheConfig {
    /// Defaults overridden by `SHELFCACHE_*` environment variables, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::default().with_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply variable overrides without validating.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        if let Some(url) = env.string("URL") {
            self.connection.url = Some(url);
        }
        set(&mut self.connection.host, env.string("HOST"));
        set(&mut self.connection.port, env.parse("PORT")?);
        if let Some(password) = env.string("PASSWORD") {
            self.connection.password = Some(password);
        }
        set(&mut self.connection.db, env.parse("DB")?);

        set(&mut self.pool.min_idle, env.parse("POOL_MIN_IDLE")?);
        set(&mut self.pool.max_idle, env.parse("POOL_MAX_IDLE")?);
        set(&mut self.pool.max_active, env.parse("POOL_MAX_ACTIVE")?);
        set(&mut self.pool.idle_timeout, env.optional_millis("POOL_IDLE_TIMEOUT_MS")?);
        set(&mut self.pool.max_lifetime, env.optional_millis("POOL_MAX_LIFETIME_MS")?);
        set(&mut self.pool.pool_timeout, env.millis("POOL_TIMEOUT_MS")?);

        set(&mut self.timeouts.dial, env.millis("DIAL_TIMEOUT_MS")?);
        set(&mut self.timeouts.read, env.millis("READ_TIMEOUT_MS")?);
        set(&mut self.timeouts.write, env.millis("WRITE_TIMEOUT_MS")?);

        set(&mut self.breaker.enabled, env.flag("BREAKER_ENABLED")?);
        set(&mut self.breaker.max_failures, env.parse("BREAKER_MAX_FAILURES")?);
        set(&mut self.breaker.reset_timeout, env.millis("BREAKER_RESET_TIMEOUT_MS")?);
        set(&mut self.breaker.half_open_requests, env.parse("BREAKER_HALF_OPEN_REQUESTS")?);

        set(&mut self.health.enabled, env.flag("HEALTH_ENABLED")?);
        set(&mut self.health.interval, env.millis("HEALTH_INTERVAL_MS")?);
        set(&mut self.health.timeout, env.millis("HEALTH_TIMEOUT_MS")?);
        set(&mut self.health.max_retries, env.parse("HEALTH_MAX_RETRIES")?);
        set(&mut self.health.retry_interval, env.millis("HEALTH_RETRY_INTERVAL_MS")?);

        set(&mut self.retry.max_retries, env.parse("RETRY_MAX_RETRIES")?);
        set(&mut self.retry.initial_backoff, env.millis("RETRY_INITIAL_BACKOFF_MS")?);
        set(&mut self.retry.max_backoff, env.millis("RETRY_MAX_BACKOFF_MS")?);
        set(&mut self.retry.factor, env.parse("RETRY_FACTOR")?);
        set(&mut self.retry.jitter, env.jitter("RETRY_JITTER")?);

        set(&mut self.metrics_interval, env.millis("METRICS_INTERVAL_MS")?);

        set(&mut self.ttl.list_page, env.millis("TTL_LIST_MS")?);
        set(&mut self.ttl.detail_page, env.millis("TTL_DETAIL_MS")?);
        set(&mut self.ttl.aggregate_page, env.millis("TTL_AGGREGATE_MS")?);
        set(&mut self.ttl.default, env.millis("TTL_DEFAULT_MS")?);

        Ok(self)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.url.is_none() && !(1..=65535).contains(&self.connection.port) {
            return Err(ConfigError::InvalidPort(self.connection.port));
        }

        let pool = &self.pool;
        if pool.max_active == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if pool.max_active > Semaphore::MAX_PERMITS {
            return Err(ConfigError::PoolTooLarge {
                max_active: pool.max_active,
                limit: Semaphore::MAX_PERMITS,
            });
        }
        if pool.max_active < pool.max_idle {
            return Err(ConfigError::MaxActiveBelowMaxIdle {
                max_active: pool.max_active,
                max_idle: pool.max_idle,
            });
        }
        if pool.min_idle > pool.max_idle {
            return Err(ConfigError::MinIdleAboveMaxIdle {
                min_idle: pool.min_idle,
                max_idle: pool.max_idle,
            });
        }
        if pool.pool_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("pool timeout"));
        }

        for (name, timeout) in [
            ("dial timeout", self.timeouts.dial),
            ("read timeout", self.timeouts.read),
            ("write timeout", self.timeouts.write),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }

        self.breaker.breaker_config()?;
        self.retry.backoff()?;

        if self.health.enabled {
            if self.health.interval.is_zero() {
                return Err(ConfigError::Health("interval must be greater than zero"));
            }
            if self.health.timeout.is_zero() {
                return Err(ConfigError::Health("timeout must be greater than zero"));
            }
            let rate = self.health.thresholds.max_error_rate;
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Health("max error rate must be within 0.0..=1.0"));
            }
        }

        if self.metrics_interval.is_zero() {
            return Err(ConfigError::ZeroTimeout("metrics interval"));
        }
        Ok(())
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.connection.url = Some(url.into());
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn without_breaker(mut self) -> Self {
        self.breaker.enabled = false;
        self
    }

    pub fn with_health(mut self, health: HealthCheckConfig) -> Self {
        self.health = health;
        self
    }

    pub fn without_health(mut self) -> Self {
        self.health.enabled = false;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn with_ttl(mut self, ttl: TtlConfig) -> Self {
        self.ttl = ttl;
        self
    }
}
