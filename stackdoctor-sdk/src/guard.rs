//! # Guarded Plugin Calls
//!
//! [`GuardedPlugin`] wraps a [`MiddlewarePlugin`] behind the resilience
//! middleware chain and (optionally) the sandbox. Calls are dispatched
//! as `(CallContext, PluginRequest)` through the composed handler, so
//! the timeout / retry / circuit-breaker / rate-limit stack applies
//! uniformly to pings, metric collection, diagnostic snapshots and
//! command execution; the sandbox's allow-list and panic isolation
//! apply on the outside.

use crate::context::CallContext;
use crate::error::PluginError;
use crate::middleware::{handler_fn, MiddlewareChain, PluginHandler, PluginRequest, PluginResponse};
use crate::models::{Command, CommandResult, DiagnosticData, MetricsSnapshot};
use crate::plugin::MiddlewarePlugin;
use crate::sandbox::Sandbox;
use std::sync::Arc;
use std::time::Instant;

pub const OP_PING: &str = "ping";
pub const OP_COLLECT_METRICS: &str = "collect_metrics";
pub const OP_DIAGNOSTIC_DATA: &str = "get_diagnostic_data";
pub const OP_EXECUTE: &str = "execute";

pub struct GuardedPlugin {
    handler: PluginHandler,
    sandbox: Option<Arc<Sandbox>>,
}

impl GuardedPlugin {
    pub fn new(
        plugin: Arc<dyn MiddlewarePlugin>,
        chain: &MiddlewareChain,
        sandbox: Option<Arc<Sandbox>>,
    ) -> Self {
        let terminal = Self::terminal_handler(plugin);
        Self {
            handler: chain.build(terminal),
            sandbox,
        }
    }

    /// The innermost handler: dispatch a [`PluginRequest`] to the trait
    /// method it names, marshalling through JSON payloads.
    fn terminal_handler(plugin: Arc<dyn MiddlewarePlugin>) -> PluginHandler {
        handler_fn(move |ctx: CallContext, req: PluginRequest| {
            let plugin = Arc::clone(&plugin);
            async move {
                let started = Instant::now();
                let payload = match req.operation.as_str() {
                    OP_PING => {
                        plugin.ping(&ctx).await?;
                        serde_json::Value::Null
                    }
                    OP_COLLECT_METRICS => {
                        let snapshot = plugin.collect_metrics(&ctx).await?;
                        serde_json::to_value(snapshot)?
                    }
                    OP_DIAGNOSTIC_DATA => {
                        let data = plugin.get_diagnostic_data(&ctx).await?;
                        serde_json::to_value(data)?
                    }
                    OP_EXECUTE => {
                        let command: Command = serde_json::from_value(req.payload)?;
                        let result = plugin.execute(&ctx, command).await?;
                        serde_json::to_value(result)?
                    }
                    other => {
                        return Err(PluginError::Unsupported {
                            operation: other.to_string(),
                        })
                    }
                };
                let mut response = PluginResponse::new(payload);
                response.latency = started.elapsed();
                Ok(response)
            }
        })
    }

    async fn call(&self, ctx: &CallContext, req: PluginRequest) -> Result<PluginResponse, PluginError> {
        match &self.sandbox {
            Some(sandbox) => {
                let handler = Arc::clone(&self.handler);
                let call_ctx = ctx.child();
                let operation = req.operation.clone();
                sandbox
                    .execute(ctx, &operation, async move { handler(call_ctx, req).await })
                    .await
            }
            None => (self.handler)(ctx.clone(), req).await,
        }
    }

    pub async fn ping(&self, ctx: &CallContext) -> Result<(), PluginError> {
        self.call(ctx, PluginRequest::new(OP_PING)).await.map(|_| ())
    }

    pub async fn collect_metrics(&self, ctx: &CallContext) -> Result<MetricsSnapshot, PluginError> {
        let response = self.call(ctx, PluginRequest::new(OP_COLLECT_METRICS)).await?;
        Ok(serde_json::from_value(response.payload)?)
    }

    pub async fn get_diagnostic_data(&self, ctx: &CallContext) -> Result<DiagnosticData, PluginError> {
        let response = self.call(ctx, PluginRequest::new(OP_DIAGNOSTIC_DATA)).await?;
        Ok(serde_json::from_value(response.payload)?)
    }

    pub async fn execute(
        &self,
        ctx: &CallContext,
        command: Command,
    ) -> Result<CommandResult, PluginError> {
        let request = PluginRequest::new(OP_EXECUTE).with_payload(serde_json::to_value(&command)?);
        let response = self.call(ctx, request).await?;
        Ok(serde_json::from_value(response.payload)?)
    }
}
