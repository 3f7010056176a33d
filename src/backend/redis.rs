//! Redis backend over pooled multiplexed tokio connections.

use super::CacheBackend;
use crate::config::{CacheConfig, TimeoutConfig};
use crate::pool::{ConnectionFactory, ConnectionPool, PoolStats};
use crate::CacheError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, RedisError, RedisResult};
use std::sync::Arc;
use std::time::Duration;

struct Dialer {
    client: Client,
    timeout: Duration,
}

#[async_trait]
impl ConnectionFactory<MultiplexedConnection> for Dialer {
    async fn create(&self) -> Result<MultiplexedConnection, CacheError> {
        match tokio::time::timeout(self.timeout, self.client.get_multiplexed_async_connection()).await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(classify(&err, self.timeout)),
            Err(_) => Err(CacheError::Timeout(self.timeout)),
        }
    }
}

/// Transport problems mean the connection is unusable.
fn is_broken(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

fn classify(err: &RedisError, timeout: Duration) -> CacheError {
    if err.is_timeout() {
        CacheError::Timeout(timeout)
    } else if is_broken(err) {
        CacheError::ConnectionFailed(err.to_string())
    } else {
        // The server answered, but not with what we asked for.
        CacheError::InvalidData(err.to_string())
    }
}

/// [`CacheBackend`] talking to a Redis server.
///
/// Dial timeout bounds new connections, read timeout bounds GET and PING, write timeout bounds
/// SET and DEL. A connection whose call failed at the transport level is discarded instead of
/// going back to the pool.
#[derive(Debug)]
pub struct RedisBackend {
    pool: ConnectionPool<MultiplexedConnection>,
    timeouts: TimeoutConfig,
}

impl RedisBackend {
    /// Build the backend; no connection is dialed until the first call or pool maintenance.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let client = Client::open(config.connection.url())
            .map_err(|e| CacheError::ConnectionFailed(format!("invalid connection url: {}", e)))?;
        let dialer = Dialer { client, timeout: config.timeouts.dial };
        Ok(Self {
            pool: ConnectionPool::new(Arc::new(dialer), config.pool.clone()),
            timeouts: config.timeouts.clone(),
        })
    }

    async fn query<T>(&self, cmd: Cmd, timeout: Duration) -> Result<T, CacheError>
    where
        T: FromRedisValue + Send,
    {
        let mut conn = self.pool.acquire().await?;
        let outcome: Result<RedisResult<T>, _> =
            tokio::time::timeout(timeout, cmd.query_async(&mut *conn)).await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if is_broken(&err) {
                    conn.discard();
                }
                Err(classify(&err, timeout))
            }
            Err(_) => {
                conn.discard();
                Err(CacheError::Timeout(timeout))
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd, self.timeouts.read).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl.filter(|t| !t.is_zero()) {
            cmd.arg("PX").arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        }
        self.query::<()>(cmd, self.timeouts.write).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.query(cmd, self.timeouts.write).await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let pong: String = self.query(redis::cmd("PING"), self.timeouts.read).await?;
        tracing::trace!(reply = %pong, "ping");
        Ok(())
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    async fn maintain(&self) -> Result<(), CacheError> {
        let dialed = self.pool.maintain().await?;
        if dialed > 0 {
            tracing::debug!(dialed, "warmed idle connections");
        }
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}
