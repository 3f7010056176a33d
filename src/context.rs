//! Caller-supplied cancellation and deadline for cache operations.
//!
//! A [`Context`] travels with every public operation. Cancelling it (or letting its deadline
//! pass) aborts the in-flight backing-store call and any pending retry backoff. Cancellation
//! surfaces as [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled), an expired deadline as
//! [`ErrorKind::Timeout`](crate::ErrorKind::Timeout).
//!
//! ```rust
//! use shelfcache::Context;
//! use std::time::Duration;
//!
//! let root = Context::background();
//! let request = root.with_timeout(Duration::from_millis(200));
//! assert!(request.deadline().is_some());
//! root.cancel(); // cancels `request` too
//! assert!(request.err().is_some());
//! ```

use crate::CacheError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline. Clones share the same token.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline unless told otherwise.
    pub fn background() -> Self {
        Self { token: CancellationToken::new(), deadline: None }
    }

    /// Wrap an existing token, e.g. a server-wide shutdown token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// Derive a child whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Derive a child with the earlier of the parent's deadline and `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self { token: self.token.child_token(), deadline: Some(deadline) }
    }

    /// Derive a child that can be cancelled without affecting this context.
    pub fn child(&self) -> Self {
        Self { token: self.token.child_token(), deadline: self.deadline }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The error this context would fail with right now, if it is already done.
    pub fn err(&self) -> Option<CacheError> {
        if self.token.is_cancelled() {
            return Some(CacheError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(CacheError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> CacheError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => CacheError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CacheError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CacheError::Cancelled
            }
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    ///
    /// The future is dropped on cancellation, which aborts any I/O it was performing.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CacheError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}
