//! # Call Context
//!
//! Every plugin, LLM and knowledge-store call in Stackdoctor accepts a
//! [`CallContext`] carrying an optional deadline and a cooperative
//! cancellation token. Contexts form a tree: a child context never outlives
//! its parent's deadline, and cancelling a parent cancels every child.
//!
//! The context is cheap to clone and safe to share across tasks. Blocking
//! points (network I/O, LLM calls, store lookups, watcher events) are
//! expected to `select!` against [`CallContext::cancelled`] or check
//! [`CallContext::check`] between steps.

use crate::error::PluginError;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation carrier threaded through every I/O call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// A context with no deadline and a fresh cancellation token.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A root context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Derive a child context whose deadline is the minimum of the parent's
    /// deadline and `now + timeout`. The child token is cancelled when the
    /// parent is.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child_deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(child_deadline)),
            None => Some(child_deadline),
        };
        Self {
            deadline,
            cancel: self.cancel.child_token(),
        }
    }

    /// Derive a child context inheriting the parent deadline.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline. `None` means no deadline; a zero
    /// duration means the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the context is cancelled. Does not cover deadline
    /// expiry; combine with a sleep against [`CallContext::deadline`] where
    /// both must be honored.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Fail fast: `Cancelled` if the token fired, `Timeout` if the deadline
    /// has passed.
    pub fn check(&self) -> Result<(), PluginError> {
        if self.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        if self.is_expired() {
            return Err(PluginError::Timeout);
        }
        Ok(())
    }

    /// Run a future against this context, translating cancellation and
    /// deadline expiry into the corresponding [`PluginError`].
    pub async fn run<F, T>(&self, fut: F) -> Result<T, PluginError>
    where
        F: std::future::Future<Output = Result<T, PluginError>>,
    {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(PluginError::Cancelled),
                    _ = tokio::time::sleep_until(deadline.into()) => Err(PluginError::Timeout),
                    res = fut => res,
                }
            }
            None => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(PluginError::Cancelled),
                    res = fut => res,
                }
            }
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}
