//! In-process backend with fault injection, for tests and local development.

use super::CacheBackend;
use crate::metrics::Operation;
use crate::pool::PoolStats;
use crate::CacheError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Timeout reported by an injected [`Fault::Timeout`].
const SIMULATED_TIMEOUT: Duration = Duration::from_secs(3);

/// A failure to inject into upcoming calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The call times out.
    Timeout,
    /// The connection is refused or drops mid-call.
    ConnectionLost,
}

impl Fault {
    fn into_error(self) -> CacheError {
        match self {
            Fault::Timeout => CacheError::Timeout(SIMULATED_TIMEOUT),
            Fault::ConnectionLost => CacheError::ConnectionFailed("connection reset by peer".into()),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        !matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Hash map behind the [`CacheBackend`] trait.
///
/// Every call is counted per command before faults are applied, so a test can assert that a call
/// never reached the store at all.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    faults: Mutex<VecDeque<Fault>>,
    latency: Mutex<Duration>,
    pool: Mutex<PoolStats>,
    calls: [AtomicU64; 4],
    maintenance_runs: AtomicU64,
    offline: AtomicBool,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn slot(op: Operation) -> usize {
    match op {
        Operation::Get => 0,
        Operation::Set => 1,
        Operation::Delete => 2,
        Operation::Ping => 3,
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Make the next `n` calls fail with `fault`.
    pub fn fail_next(&self, n: usize, fault: Fault) {
        lock(&self.faults).extend((0..n).map(|_| fault));
    }

    /// Drop any queued faults.
    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// While offline every call fails as if the store were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Gauges returned by [`CacheBackend::pool_stats`].
    pub fn set_pool_stats(&self, stats: PoolStats) {
        *lock(&self.pool) = stats;
    }

    /// Calls of `op` that reached the backend, including failed ones.
    pub fn calls(&self, op: Operation) -> u64 {
        self.calls[slot(op)].load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    pub fn maintenance_runs(&self) -> u64 {
        self.maintenance_runs.load(Ordering::SeqCst)
    }

    /// Live keys, ignoring faults.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.entries).values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        lock(&self.entries).get(key).is_some_and(|e| e.is_live(now))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: Operation) -> Result<(), CacheError> {
        self.calls[slot(op)].fetch_add(1, Ordering::SeqCst);

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::ConnectionFailed("backend closed".into()));
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::ConnectionFailed("connection refused".into()));
        }
        match lock(&self.faults).pop_front() {
            Some(fault) => Err(fault.into_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.enter(Operation::Get).await?;
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.enter(Operation::Set).await?;
        let expires_at = ttl.filter(|t| !t.is_zero()).map(|t| Instant::now() + t);
        lock(&self.entries).insert(key.to_string(), Entry { value: value.to_string(), expires_at });
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.enter(Operation::Delete).await?;
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let removed = keys
            .iter()
            .filter_map(|k| entries.remove(k))
            .filter(|e| e.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.enter(Operation::Ping).await
    }

    fn pool_stats(&self) -> PoolStats {
        lock(&self.pool).clone()
    }

    async fn maintain(&self) -> Result<(), CacheError> {
        self.maintenance_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.entries).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_deletes() {
        let backend = MemoryBackend::new();
        backend.set("a", "1", None).await.unwrap();
        backend.set("b", "2", None).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(backend.get("zzz").await.unwrap(), None);

        let removed = backend.delete(&["a".into(), "missing".into()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.calls(Operation::Get), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", Some(Duration::from_secs(10))).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let backend = MemoryBackend::new();
        backend.fail_next(1, Fault::Timeout);
        backend.fail_next(1, Fault::ConnectionLost);

        assert!(backend.ping().await.unwrap_err().is_timeout());
        assert!(matches!(backend.ping().await, Err(CacheError::ConnectionFailed(_))));
        assert!(backend.ping().await.is_ok());
        assert_eq!(backend.calls(Operation::Ping), 3);
    }

    #[tokio::test]
    async fn offline_and_closed_refuse_calls() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        assert!(backend.get("k").await.is_err());
        backend.set_offline(false);
        backend.close().await;
        assert!(backend.is_closed());
        assert!(backend.set("k", "v", None).await.is_err());
    }
}
