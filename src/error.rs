//! Error types for cache operations
use crate::client::ClientStatus;
use crate::config::ConfigError;
use crate::metrics::Operation;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`CacheError`], stable across wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Key absent. Not a failure.
    NotFound,
    /// The backing store could not be reached or the connection broke.
    ConnectionFailed,
    /// The operation or the caller's deadline timed out.
    Timeout,
    /// The caller cancelled the operation.
    Cancelled,
    /// The client is not connected, still initializing, or closed.
    ClientNotReady,
    /// A cached payload could not be decoded.
    InvalidData,
    /// Rejected by an open circuit breaker.
    CircuitOpen,
    /// Rejected because the half-open probe budget is used up.
    CircuitHalfOpenSaturated,
    /// Invalid configuration.
    Config,
}

/// Unified error type for the cache client.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key does not exist in the backing store
    #[error("key not found")]
    NotFound,
    /// The backing store could not be reached or returned a transport error
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// A single backing-store call exceeded its timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The caller's deadline passed before the operation finished
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,
    /// No connection could be checked out of the pool in time
    #[error("timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),
    /// The client refuses work in its current state
    #[error("client not ready (status: {0})")]
    ClientNotReady(ClientStatus),
    /// A cached payload failed to decode
    #[error("invalid cached data: {0}")]
    InvalidData(String),
    /// The circuit breaker is open
    #[error("circuit breaker open ({failures} consecutive failures, open for {open_for:?})")]
    CircuitOpen { failures: u64, open_for: Duration },
    /// The circuit breaker is half-open and all probe slots are taken
    #[error("circuit breaker half-open: too many requests ({in_flight} of {limit} probes in flight)")]
    CircuitHalfOpenSaturated { in_flight: u32, limit: u32 },
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// An operation failed; carries the operation and key for diagnostics
    #[error("{op} {key}: {source}")]
    Operation {
        op: Operation,
        key: String,
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    /// Wrap this error with the operation name and key.
    ///
    /// Already-wrapped errors and `NotFound` are returned unchanged.
    pub fn with_operation(self, op: Operation, key: impl Into<String>) -> Self {
        match self {
            Self::NotFound | Self::Operation { .. } => self,
            other => Self::Operation { op, key: key.into(), source: Box::new(other) },
        }
    }

    /// Classify the error, looking through operation wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Self::Timeout(_) | Self::DeadlineExceeded | Self::PoolTimeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ClientNotReady(_) => ErrorKind::ClientNotReady,
            Self::InvalidData(_) => ErrorKind::InvalidData,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::CircuitHalfOpenSaturated { .. } => ErrorKind::CircuitHalfOpenSaturated,
            Self::Config(_) => ErrorKind::Config,
            Self::Operation { source, .. } => source.kind(),
        }
    }

    /// The innermost error, with operation wrappers removed.
    pub fn root(&self) -> &CacheError {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if the key was simply absent
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this error is a breaker rejection (open or half-open saturated)
    pub fn is_circuit_open(&self) -> bool {
        matches!(self.kind(), ErrorKind::CircuitOpen | ErrorKind::CircuitHalfOpenSaturated)
    }

    /// Check if this error is due to a timeout or expired deadline
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Check if this error came from caller cancellation
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Transport-level failures worth another attempt.
    ///
    /// A caller deadline is final even though it shares the timeout kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::ConnectionFailed(_) | Self::Timeout(_) | Self::PoolTimeout(_)
        )
    }

    /// Whether this outcome says something about the health of the backing store.
    ///
    /// Used to decide what gets recorded as a breaker failure.
    pub(crate) fn counts_as_failure(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConnectionFailed | ErrorKind::Timeout)
            && !matches!(self.root(), Self::DeadlineExceeded)
    }
}
