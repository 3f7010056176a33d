#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # shelfcache
//!
//! A resilient client for a remote key-value cache. Every operation goes through the same
//! pipeline: readiness check, circuit-breaker admission, retry-wrapped execution against a pooled
//! connection, then outcome recording into the breaker, the metrics aggregator and the health
//! checker's sliding windows.
//!
//! ## Features
//!
//! - **Circuit breaker** with Closed/Open/Half-Open states and bounded half-open probes
//! - **Retries** with capped exponential backoff, optional jitter and cancellation
//! - **Health checking** in the background with healthy/degraded/unhealthy classification
//! - **Metrics** per operation, cache hit ratio and pool gauges
//! - **Connection pool** with idle/lifetime eviction and acquire timeouts
//!
//! ## Quick Start
//!
//! ```rust
//! use shelfcache::{CacheConfig, Context, MemoryBackend, ResilientClient};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), shelfcache::CacheError> {
//!     let client = ResilientClient::new(CacheConfig::default(), Arc::new(MemoryBackend::new()))?;
//!     let ctx = Context::background();
//!     client.connect(&ctx).await?;
//!
//!     client.set(&ctx, "book:42", "Dune", Duration::from_secs(60)).await?;
//!     let (value, found) = client.get(&ctx, "book:42").await?;
//!     assert!(found);
//!     assert_eq!(value, "Dune");
//!
//!     client.close().await
//! }
//! ```

pub mod backend;
pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod jitter;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod sleeper;
pub mod window;

// Re-exports
pub use backend::{CacheBackend, Fault, MemoryBackend};
#[cfg(feature = "redis")]
pub use backend::RedisBackend;
pub use backoff::{Backoff, BackoffError};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitMetrics,
    CircuitState,
};
pub use client::{ClientStatus, ResilientClient, SoftFailure};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    BreakerSettings, CacheConfig, ConfigError, ConnectionConfig, HealthCheckConfig, PoolConfig,
    TimeoutConfig, TtlClass, TtlConfig,
};
pub use context::Context;
pub use error::{CacheError, ErrorKind};
pub use health::{HealthChecker, HealthStatus, HealthThresholds};
pub use jitter::Jitter;
pub use metrics::{ClientStats, Metrics, Operation, OperationStats};
pub use pool::{ConnectionFactory, ConnectionPool, PoolStats, PooledConnection};
pub use retry::{Retrier, RetryPolicy};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use window::TimeWindow;
