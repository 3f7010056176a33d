//! Generic connection pool for backing-store connections.
//!
//! - At most `max_active` connections are checked out at once; further callers wait up to
//!   `pool_timeout` and then fail with [`CacheError::PoolTimeout`].
//! - Returned connections go back to an idle list capped at `max_idle`; the rest are closed.
//! - Idle connections unused for longer than `idle_timeout`, or older than `max_lifetime`, are
//!   closed instead of reused.
//! - [`ConnectionPool::maintain`] pre-dials connections until `min_idle` are idle.
//! - Connections that hit a transport error should be [`discard`](PooledConnection::discard)ed so
//!   they never return to the pool.

use crate::config::PoolConfig;
use crate::CacheError;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tokio::time::Instant;

/// Factory for new connections.
#[async_trait::async_trait]
pub trait ConnectionFactory<C: Send + 'static>: Send + Sync {
    /// Dial a new connection.
    async fn create(&self) -> Result<C, CacheError>;
}

/// Pool gauges and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_active: usize,
    /// Connections currently checked out.
    pub active: usize,
    /// Connections waiting in the idle list.
    pub idle: usize,
    /// Checkouts served from the idle list.
    pub hits: u64,
    /// Checkouts that had to dial a new connection.
    pub misses: u64,
    /// Checkouts that gave up waiting for a free slot.
    pub timeouts: u64,
    /// Idle connections closed for exceeding idle timeout or max lifetime.
    pub stale_closed: u64,
}

#[derive(Debug)]
struct IdleConn<C> {
    conn: C,
    created_at: Instant,
    last_used: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale_closed: AtomicU64,
}

/// Bounded pool of connections of type `C`.
pub struct ConnectionPool<C: Send + 'static> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<C>>,
    idle: Mutex<VecDeque<IdleConn<C>>>,
    slots: Semaphore,
    counters: Counters,
    closed: AtomicBool,
}

impl<C: Send + 'static> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

fn pool_closed() -> CacheError {
    CacheError::ConnectionFailed("connection pool closed".into())
}

impl<C: Send + 'static> ConnectionPool<C> {
    pub fn new(factory: Arc<dyn ConnectionFactory<C>>, config: PoolConfig) -> Self {
        let slots = Semaphore::new(config.max_active.min(Semaphore::MAX_PERMITS));
        Self {
            config,
            factory,
            idle: Mutex::new(VecDeque::new()),
            slots,
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn idle_list(&self) -> MutexGuard<'_, VecDeque<IdleConn<C>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, created_at: Instant, last_used: Instant, now: Instant) -> bool {
        let too_old = self
            .config
            .max_lifetime
            .is_some_and(|max| now.saturating_duration_since(created_at) > max);
        let idle_too_long = self
            .config
            .idle_timeout
            .is_some_and(|max| now.saturating_duration_since(last_used) > max);
        too_old || idle_too_long
    }

    /// Close idle connections past their idle timeout or lifetime. Returns how many were closed.
    fn evict_expired(&self, idle: &mut VecDeque<IdleConn<C>>) -> usize {
        let now = Instant::now();
        let before = idle.len();
        idle.retain(|c| !self.is_expired(c.created_at, c.last_used, now));
        let evicted = before - idle.len();
        if evicted > 0 {
            self.counters.stale_closed.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, "closed stale pooled connections");
        }
        evicted
    }

    /// Check out a connection, reusing an idle one when possible.
    pub async fn acquire(&self) -> Result<PooledConnection<'_, C>, CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(pool_closed());
        }

        let permit = match self.slots.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(pool_closed()),
            Err(TryAcquireError::NoPermits) => {
                match tokio::time::timeout(self.config.pool_timeout, self.slots.acquire()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(pool_closed()),
                    Err(_) => {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(CacheError::PoolTimeout(self.config.pool_timeout));
                    }
                }
            }
        };

        let reused = {
            let mut idle = self.idle_list();
            self.evict_expired(&mut idle);
            idle.pop_back()
        };
        if let Some(idle) = reused {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PooledConnection::new(self, idle.conn, idle.created_at, permit));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let conn = self.factory.create().await?;
        Ok(PooledConnection::new(self, conn, Instant::now(), permit))
    }

    fn put_back(&self, conn: C, created_at: Instant) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        if self.is_expired(created_at, now, now) {
            self.counters.stale_closed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut idle = self.idle_list();
        if idle.len() < self.config.max_idle {
            idle.push_back(IdleConn { conn, created_at, last_used: now });
        }
    }

    /// Evict stale idle connections and dial new ones until `min_idle` are idle, without
    /// exceeding `max_active` in total. Returns how many connections were dialed.
    pub async fn maintain(&self) -> Result<usize, CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let needed = {
            let mut idle = self.idle_list();
            self.evict_expired(&mut idle);
            let total = idle.len() + self.active();
            let want = self.config.min_idle.min(self.config.max_idle).saturating_sub(idle.len());
            want.min(self.config.max_active.saturating_sub(total))
        };

        for created in 0..needed {
            let conn = match self.factory.create().await {
                Ok(conn) => conn,
                Err(err) if created > 0 => {
                    tracing::debug!(created, error = %err, "pool warm-up stopped early");
                    return Ok(created);
                }
                Err(err) => return Err(err),
            };
            let now = Instant::now();
            self.idle_list().push_back(IdleConn { conn, created_at: now, last_used: now });
        }
        Ok(needed)
    }

    fn active(&self) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        self.config.max_active.saturating_sub(self.slots.available_permits())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_active: self.config.max_active,
            active: self.active(),
            idle: self.idle_list().len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            stale_closed: self.counters.stale_closed.load(Ordering::Relaxed),
        }
    }

    /// Close the pool: drop idle connections and refuse further checkouts. Connections already
    /// checked out are closed when they are returned.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.close();
        self.idle_list().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A checked-out connection. Returns to the pool on drop unless discarded.
#[derive(Debug)]
pub struct PooledConnection<'a, C: Send + 'static> {
    pool: &'a ConnectionPool<C>,
    conn: Option<C>,
    created_at: Instant,
    discard: bool,
    _permit: SemaphorePermit<'a>,
}

impl<'a, C: Send + 'static> PooledConnection<'a, C> {
    fn new(
        pool: &'a ConnectionPool<C>,
        conn: C,
        created_at: Instant,
        permit: SemaphorePermit<'a>,
    ) -> Self {
        Self { pool, conn: Some(conn), created_at, discard: false, _permit: permit }
    }

    /// Close this connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<C: Send + 'static> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `Drop` takes the connection out.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Send + 'static> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Send + 'static> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.discard {
                self.pool.put_back(conn, self.created_at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CountingFactory {
        created: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<usize> for CountingFactory {
        async fn create(&self) -> Result<usize, CacheError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CacheError::ConnectionFailed("refused".into()));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn pool(config: PoolConfig) -> (ConnectionPool<usize>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        (ConnectionPool::new(factory.clone(), config), factory)
    }

    fn config() -> PoolConfig {
        PoolConfig {
            min_idle: 0,
            max_idle: 2,
            max_active: 3,
            idle_timeout: Some(Duration::from_secs(60)),
            max_lifetime: Some(Duration::from_secs(600)),
            pool_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn returned_connections_are_reused() {
        let (pool, factory) = pool(config());
        {
            let conn = pool.acquire().await.unwrap();
            assert_eq!(*conn, 0);
            assert_eq!(pool.stats().active, 1);
        }
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn discarded_connections_are_not_reused() {
        let (pool, _) = pool(config());
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.discard();
        }
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(*pool.acquire().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_all_slots_are_busy() {
        let (pool, _) = pool(config());
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let _c = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, CacheError::PoolTimeout(_)));
        assert_eq!(pool.stats().timeouts, 1);
        assert_eq!(pool.stats().active, 3);
    }

    #[tokio::test]
    async fn idle_list_is_capped_at_max_idle() {
        let (pool, _) = pool(config());
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        drop((a, b, c));
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_evicts_on_next_checkout() {
        let (pool, factory) = pool(config());
        drop(pool.acquire().await.unwrap());
        tokio::time::advance(Duration::from_secs(61)).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 1, "stale connection must not be reused");
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().stale_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_lifetime_stops_reuse() {
        let (pool, _) = pool(PoolConfig { idle_timeout: None, ..config() });
        let conn = pool.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;
        drop(conn);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().stale_closed, 1);
    }

    #[tokio::test]
    async fn maintain_tops_up_min_idle() {
        let (pool, factory) = pool(PoolConfig { min_idle: 2, ..config() });
        assert_eq!(pool.maintain().await.unwrap(), 2);
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(pool.maintain().await.unwrap(), 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn maintain_respects_max_active() {
        let (pool, _) = pool(PoolConfig { min_idle: 2, max_idle: 2, max_active: 2, ..config() });
        let _held = pool.acquire().await.unwrap();
        assert_eq!(pool.maintain().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dial_failure_releases_the_slot() {
        let (pool, factory) = pool(PoolConfig { max_active: 1, ..config() });
        factory.fail.store(true, Ordering::SeqCst);
        assert!(pool.acquire().await.is_err());
        factory.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn closed_pool_refuses_checkouts() {
        let (pool, _) = pool(config());
        let held = pool.acquire().await.unwrap();
        pool.close();
        pool.close();
        assert!(matches!(pool.acquire().await, Err(CacheError::ConnectionFailed(_))));
        drop(held);
        assert_eq!(pool.stats().idle, 0);
    }
}
