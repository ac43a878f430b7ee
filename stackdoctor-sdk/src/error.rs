//! # Error Handling Module
//!
//! This module defines the plugin-facing error taxonomy for the Stackdoctor
//! SDK. Errors are grouped by how callers react to them rather than by
//! where they originate:
//!
//! - **Connection setup** — `NotConnected`, `ConnectFailed`, `Disconnected`:
//!   plugin I/O could not be established; the lifecycle manager moves the
//!   plugin to its error state.
//! - **Cancellation boundary** — `Timeout`, `Cancelled`: a deadline or
//!   cooperative cancellation token fired mid-call.
//! - **Pressure shedding** — `RateLimited`, `CircuitOpen`: the resilience
//!   chain refused the call; safe to retry after backoff.
//! - **Caller errors** — `Unsupported`, `NotAllowed`, `InvalidArgument`:
//!   never retried.
//! - **Partial failures** — `CollectionFailed`, `ExecutionPanic`,
//!   `Protocol`: a single collection or action failed; the diagnosis
//!   pipeline degrades instead of aborting where it can.
//!
//! [`PluginError::is_retriable`] is the default classification used by the
//! retry middleware; custom predicates can be supplied per chain.

use thiserror::Error;

/// Errors produced by middleware plugins, the resilience chain and the
/// sandbox.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Operation requires an established connection
    #[error("plugin is not connected")]
    NotConnected,

    /// Connection establishment failed
    #[error("connect failed: {message}")]
    ConnectFailed { message: String },

    /// The underlying connection dropped mid-operation
    #[error("connection lost")]
    Disconnected,

    /// A deadline elapsed before the operation completed
    #[error("operation timed out")]
    Timeout,

    /// The cancellation token fired before the operation completed
    #[error("operation cancelled")]
    Cancelled,

    /// The rate limiter shed this call
    #[error("rate limit exceeded")]
    RateLimited,

    /// The circuit breaker is open
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The plugin does not implement this operation
    #[error("unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// The operation is blocked by an allow/deny list
    #[error("operation not allowed: {operation}")]
    NotAllowed { operation: String },

    /// The caller supplied an invalid argument
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A metric or diagnostic collection failed
    #[error("collection failed: {message}")]
    CollectionFailed { message: String },

    /// A sandboxed action panicked; carries the recovered payload
    #[error("execution panicked: {message}")]
    ExecutionPanic { message: String },

    /// The backend answered with something the adapter could not interpret
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// HTTP transport errors (Elasticsearch adapter, LLM adapter)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Redis client errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON (de)serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem and socket level errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Default retry classification for the resilience chain.
    ///
    /// Caller errors and cancellation are never retried; transport
    /// failures and pressure shedding are.
    pub fn is_retriable(&self) -> bool {
        match self {
            PluginError::Timeout
            | PluginError::RateLimited
            | PluginError::CircuitOpen
            | PluginError::Disconnected
            | PluginError::Http(_)
            | PluginError::Redis(_)
            | PluginError::Io(_) => true,
            PluginError::NotConnected
            | PluginError::ConnectFailed { .. }
            | PluginError::Cancelled
            | PluginError::Unsupported { .. }
            | PluginError::NotAllowed { .. }
            | PluginError::InvalidArgument { .. }
            | PluginError::CollectionFailed { .. }
            | PluginError::ExecutionPanic { .. }
            | PluginError::Protocol { .. }
            | PluginError::Serialization(_) => false,
        }
    }

    pub fn collection(message: impl Into<String>) -> Self {
        PluginError::CollectionFailed {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        PluginError::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        PluginError::InvalidArgument {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_not_retriable() {
        assert!(!PluginError::Cancelled.is_retriable());
        assert!(!PluginError::NotAllowed {
            operation: "FLUSHALL".into()
        }
        .is_retriable());
        assert!(!PluginError::invalid("bad port").is_retriable());
    }

    #[test]
    fn shed_and_transport_errors_are_retriable() {
        assert!(PluginError::Timeout.is_retriable());
        assert!(PluginError::RateLimited.is_retriable());
        assert!(PluginError::CircuitOpen.is_retriable());
        assert!(PluginError::Disconnected.is_retriable());
    }
}
