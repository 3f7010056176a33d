//! The backing key-value store, seen through a narrow async trait.
//!
//! The client only needs GET/SET/DEL/PING plus a "key not found" answer that is distinct from a
//! transport error: [`CacheBackend::get`] returns `Ok(None)` for a missing key and reserves `Err`
//! for failures. Per-call network timeouts are the backend's job; retries, the breaker and
//! metrics live in the client.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{Fault, MemoryBackend};
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

use crate::pool::PoolStats;
use crate::CacheError;
use async_trait::async_trait;
use std::time::Duration;

/// A remote key-value store.
#[async_trait]
pub trait CacheBackend: Send + Sync + std::fmt::Debug {
    /// Value stored under `key`, `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` under `key`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Remove `keys`, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Round-trip to the store.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Current connection pool gauges.
    fn pool_stats(&self) -> PoolStats;

    /// Periodic upkeep such as evicting stale connections and warming idle ones.
    async fn maintain(&self) -> Result<(), CacheError> {
        Ok(())
    }

    /// Release every connection. Calls made afterwards fail.
    async fn close(&self);
}
