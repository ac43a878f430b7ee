//! # Resilience Middleware Chain
//!
//! Plugin calls are modeled as `(CallContext, PluginRequest) ->
//! PluginResponse` and wrapped by composable middlewares. A
//! [`Middleware`] turns one [`PluginHandler`] into another; the
//! [`MiddlewareChain`] composes right-to-left so the **first middleware
//! added is the outermost** — the conventional layering is
//! timeout → retry → circuit breaker → rate limiter → plugin.
//!
//! Provided middlewares:
//!
//! - [`timeout::TimeoutMiddleware`] — per-call child deadline; the guarded
//!   call runs on its own task and is abandoned (not awaited) on expiry.
//! - [`retry::RetryMiddleware`] — bounded retries with exponential
//!   backoff; retriability is predicate-driven; cancellation aborts
//!   immediately.
//! - [`circuit_breaker::CircuitBreakerMiddleware`] — rolling-window
//!   failure-ratio breaker with half-open probing.
//! - [`rate_limit::RateLimiterMiddleware`] — token bucket; sheds with
//!   `RateLimited` without invoking the inner handler.

use crate::context::CallContext;
use crate::error::PluginError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerMiddleware, CircuitState};
pub use rate_limit::{RateLimiterConfig, RateLimiterMiddleware};
pub use retry::{RetryConfig, RetryMiddleware};
pub use timeout::TimeoutMiddleware;

/// A request traversing the chain on its way to a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    /// Operation name, e.g. `collect_metrics` or a command name.
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PluginRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// The response produced by a plugin call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResponse {
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Time spent in the innermost handler.
    #[serde(with = "crate::common::duration_serde")]
    pub latency: Duration,
}

impl PluginResponse {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            latency: Duration::ZERO,
        }
    }
}

/// A boxed async call, shareable across tasks.
pub type PluginHandler = Arc<
    dyn Fn(CallContext, PluginRequest) -> BoxFuture<'static, Result<PluginResponse, PluginError>>
        + Send
        + Sync,
>;

/// Wraps a handler with additional behavior.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn wrap(&self, next: PluginHandler) -> PluginHandler;
}

/// Lift an async closure into a [`PluginHandler`].
pub fn handler_fn<F, Fut>(f: F) -> PluginHandler
where
    F: Fn(CallContext, PluginRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<PluginResponse, PluginError>> + Send + 'static,
{
    Arc::new(move |ctx, req| Box::pin(f(ctx, req)))
}

/// An ordered stack of middlewares. Built right-to-left: the first layer
/// added wraps everything that follows.
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn layer(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.layers.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Compose the chain around a terminal handler.
    pub fn build(&self, terminal: PluginHandler) -> PluginHandler {
        let mut handler = terminal;
        for layer in self.layers.iter().rev() {
            tracing::debug!(middleware = layer.name(), "wrapping plugin handler");
            handler = layer.wrap(handler);
        }
        handler
    }
}
