//! Bounded retries with exponential backoff.
//!
//! Backoff is `base × 2^attempt`, capped at `max_delay`, with optional
//! jitter of up to half the computed delay. Whether an error is worth
//! retrying is decided by a caller-supplied predicate; the default is
//! [`PluginError::is_retriable`]. Cancellation aborts the loop
//! immediately, including mid-backoff.

use super::{Middleware, PluginHandler};
use crate::error::PluginError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub type RetryPredicate = Arc<dyn Fn(&PluginError) -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "crate::common::duration_serde")]
    pub base_delay: Duration,
    #[serde(with = "crate::common::duration_serde")]
    pub max_delay: Duration,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

pub struct RetryMiddleware {
    config: RetryConfig,
    retriable: RetryPredicate,
}

impl RetryMiddleware {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retriable: Arc::new(PluginError::is_retriable),
        }
    }

    /// Replace the default retriability classification.
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.retriable = predicate;
        self
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.config.max_delay);
        if self.config.jitter && !exp.is_zero() {
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..=exp / 2);
            (exp + jitter).min(self.config.max_delay)
        } else {
            exp
        }
    }
}

impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    fn wrap(&self, next: PluginHandler) -> PluginHandler {
        let config = self.config.clone();
        let retriable = Arc::clone(&self.retriable);
        let this = RetryMiddleware {
            config: config.clone(),
            retriable: Arc::clone(&retriable),
        };
        let this = Arc::new(this);
        Arc::new(move |ctx, req| {
            let next = Arc::clone(&next);
            let this = Arc::clone(&this);
            Box::pin(async move {
                let mut attempt = 0u32;
                loop {
                    ctx.check()?;
                    match next(ctx.clone(), req.clone()).await {
                        Ok(response) => return Ok(response),
                        Err(err) => {
                            let out_of_budget = attempt >= this.config.max_retries;
                            if out_of_budget || !(this.retriable)(&err) {
                                return Err(err);
                            }
                            let delay = this.backoff_delay(attempt);
                            tracing::debug!(
                                operation = %req.operation,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "retrying plugin call"
                            );
                            tokio::select! {
                                _ = ctx.cancelled() => return Err(PluginError::Cancelled),
                                _ = tokio::time::sleep(delay) => {}
                            }
                            attempt += 1;
                        }
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::middleware::{handler_fn, PluginRequest, PluginResponse};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky_handler(failures: u32, calls: Arc<AtomicU32>) -> PluginHandler {
        handler_fn(move |_ctx, _req| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(PluginError::Disconnected)
                } else {
                    Ok(PluginResponse::new(serde_json::json!("ok")))
                }
            }
        })
    }

    fn quick_retry(max_retries: u32) -> RetryMiddleware {
        RetryMiddleware::new(RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        })
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = quick_retry(3).wrap(flaky_handler(2, Arc::clone(&calls)));

        let res = handler(CallContext::background(), PluginRequest::new("op")).await;
        assert!(res.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = quick_retry(2).wrap(flaky_handler(10, Arc::clone(&calls)));

        let res = handler(CallContext::background(), PluginRequest::new("op")).await;
        assert!(matches!(res, Err(PluginError::Disconnected)));
        // initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retriable_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = Arc::clone(&calls);
        let handler = quick_retry(5).wrap(handler_fn(move |_ctx, _req| {
            let calls = Arc::clone(&calls_inner);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PluginError::NotAllowed {
                    operation: "FLUSHALL".into(),
                })
            }
        }));

        let res = handler(CallContext::background(), PluginRequest::new("op")).await;
        assert!(matches!(res, Err(PluginError::NotAllowed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_loop() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = RetryMiddleware::new(RetryConfig {
            max_retries: 50,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            jitter: false,
        })
        .wrap(flaky_handler(u32::MAX, Arc::clone(&calls)));

        let ctx = CallContext::background();
        let cancel_ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_ctx.cancel();
        });

        let res = handler(ctx, PluginRequest::new("op")).await;
        assert!(matches!(res, Err(PluginError::Cancelled)));
        assert!(calls.load(Ordering::SeqCst) < 5);
    }

    #[tokio::test]
    async fn custom_predicate_overrides_default() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = Arc::clone(&calls);
        let handler = quick_retry(3)
            .with_predicate(Arc::new(|_| false))
            .wrap(handler_fn(move |_ctx, _req| {
                let calls = Arc::clone(&calls_inner);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PluginError::Timeout)
                }
            }));

        let res = handler(CallContext::background(), PluginRequest::new("op")).await;
        assert!(matches!(res, Err(PluginError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
