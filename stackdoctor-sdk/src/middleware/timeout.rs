//! Per-call deadline enforcement.
//!
//! The guarded call runs on a spawned task. On expiry the middleware
//! returns [`PluginError::Timeout`] immediately and aborts the task
//! instead of awaiting it, so a stuck plugin cannot block cancellation
//! of the caller.

use super::{Middleware, PluginHandler};
use crate::error::PluginError;
use std::sync::Arc;
use std::time::Duration;

pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    fn wrap(&self, next: PluginHandler) -> PluginHandler {
        let timeout = self.timeout;
        Arc::new(move |ctx, req| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let child = ctx.child_with_timeout(timeout);
                let deadline = child
                    .deadline()
                    .expect("child_with_timeout always sets a deadline");

                let call_ctx = child.clone();
                let mut task = tokio::spawn(async move { next(call_ctx, req).await });

                tokio::select! {
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        task.abort();
                        child.cancel();
                        tracing::warn!(timeout_ms = timeout.as_millis() as u64, "plugin call timed out");
                        Err(PluginError::Timeout)
                    }
                    _ = ctx.cancelled() => {
                        task.abort();
                        child.cancel();
                        Err(PluginError::Cancelled)
                    }
                    joined = &mut task => {
                        match joined {
                            Ok(result) => result,
                            Err(err) if err.is_panic() => Err(PluginError::ExecutionPanic {
                                message: panic_message(err),
                            }),
                            Err(_) => Err(PluginError::Cancelled),
                        }
                    }
                }
            })
        })
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "opaque panic payload".to_string()
            }
        }
        Err(_) => "task aborted".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::middleware::{handler_fn, PluginRequest, PluginResponse};
    use std::time::Instant;

    #[tokio::test]
    async fn returns_timeout_without_waiting_for_the_task() {
        let mw = TimeoutMiddleware::new(Duration::from_millis(20));
        let handler = mw.wrap(handler_fn(|_ctx, _req| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(PluginResponse::new(serde_json::Value::Null))
        }));

        let started = Instant::now();
        let res = handler(CallContext::background(), PluginRequest::new("slow")).await;
        assert!(matches!(res, Err(PluginError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let mw = TimeoutMiddleware::new(Duration::from_secs(5));
        let handler = mw.wrap(handler_fn(|_ctx, _req| async {
            Ok(PluginResponse::new(serde_json::json!("pong")))
        }));

        let res = handler(CallContext::background(), PluginRequest::new("ping"))
            .await
            .unwrap();
        assert_eq!(res.payload, serde_json::json!("pong"));
    }

    #[tokio::test]
    async fn panic_in_plugin_surfaces_as_execution_panic() {
        let mw = TimeoutMiddleware::new(Duration::from_secs(5));
        let handler = mw.wrap(handler_fn(|_ctx, _req| async { panic!("boom") }));

        let res = handler(CallContext::background(), PluginRequest::new("explode")).await;
        match res {
            Err(PluginError::ExecutionPanic { message }) => assert!(message.contains("boom")),
            other => panic!("expected ExecutionPanic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn caller_cancellation_wins() {
        let mw = TimeoutMiddleware::new(Duration::from_secs(30));
        let handler = mw.wrap(handler_fn(|_ctx, _req| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(PluginResponse::new(serde_json::Value::Null))
        }));

        let ctx = CallContext::background();
        let cancel_ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_ctx.cancel();
        });

        let res = handler(ctx, PluginRequest::new("slow")).await;
        assert!(matches!(res, Err(PluginError::Cancelled)));
    }
}
