//! Operation counters, cache hit/miss tallies and pool gauges.
//!
//! Per-operation counters are plain atomics indexed by [`Operation`], so recording never takes a
//! lock and never contends with the client's status lock or the breaker's lock. Pool gauges are
//! written by the sampler task and read by snapshots under their own `RwLock`.

use crate::circuit_breaker::CircuitMetrics;
use crate::client::ClientStatus;
use crate::health::HealthStatus;
use crate::pool::PoolStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Cache operations tracked by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Get,
    Set,
    Delete,
    Ping,
}

impl Operation {
    pub const ALL: [Operation; 4] = [Operation::Get, Operation::Set, Operation::Delete, Operation::Ping];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Delete => "delete",
            Operation::Ping => "ping",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct OpCounters {
    count: AtomicU64,
    errors: AtomicU64,
    latency_micros: AtomicU64,
    max_latency_micros: AtomicU64,
}

/// Snapshot of one operation's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub operation: Operation,
    pub count: u64,
    pub errors: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
}

impl OperationStats {
    pub fn avg_latency(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total_latency / u32::try_from(self.count).unwrap_or(u32::MAX)
    }
}

/// Lock-free counters shared by every caller of the client.
#[derive(Debug, Default)]
pub struct Metrics {
    ops: [OpCounters; 4],
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    pool: RwLock<PoolStats>,
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one invocation of `op` that took `latency`.
    pub fn record(&self, op: Operation, latency: Duration, failed: bool) {
        let c = &self.ops[op.index()];
        let us = micros(latency);
        c.count.fetch_add(1, Ordering::Relaxed);
        c.latency_micros.fetch_add(us, Ordering::Relaxed);
        c.max_latency_micros.fetch_max(us, Ordering::Relaxed);
        if failed {
            c.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Replace the pool gauges with a fresh sample.
    pub fn set_pool_stats(&self, stats: PoolStats) {
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = stats;
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn operation(&self, op: Operation) -> OperationStats {
        let c = &self.ops[op.index()];
        OperationStats {
            operation: op,
            count: c.count.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(c.latency_micros.load(Ordering::Relaxed)),
            max_latency: Duration::from_micros(c.max_latency_micros.load(Ordering::Relaxed)),
        }
    }

    pub fn operations(&self) -> Vec<OperationStats> {
        Operation::ALL.iter().map(|op| self.operation(*op)).collect()
    }
}

/// Everything the client knows about itself, for status endpoints and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub status: ClientStatus,
    pub last_error: Option<String>,
    pub operations: Vec<OperationStats>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pool: PoolStats,
    pub circuit: Option<CircuitMetrics>,
    pub health: Option<HealthStatus>,
}

impl ClientStats {
    /// Hits over lookups, `0.0` before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / lookups as f64
    }

    pub fn operation(&self, op: Operation) -> Option<&OperationStats> {
        self.operations.iter().find(|s| s.operation == op)
    }
}
