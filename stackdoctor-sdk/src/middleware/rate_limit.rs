//! Token-bucket rate limiting.
//!
//! The bucket holds up to `burst` tokens and refills at `rps` tokens per
//! second. Each admitted call costs one token; an empty bucket sheds the
//! call with [`PluginError::RateLimited`] without invoking the inner
//! handler. Admission is a single short mutex section, O(1) under
//! contention.

use super::{Middleware, PluginHandler};
use crate::error::PluginError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Sustained refill rate, tokens per second.
    pub rps: f64,
    /// Bucket capacity.
    pub burst: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rps: 50.0,
            burst: 100.0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiterMiddleware {
    config: RateLimiterConfig,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiterMiddleware {
    pub fn new(config: RateLimiterConfig) -> Self {
        let bucket = Bucket {
            tokens: config.burst,
            last_refill: Instant::now(),
        };
        Self {
            config,
            bucket: Arc::new(Mutex::new(bucket)),
        }
    }

    fn try_acquire(config: &RateLimiterConfig, bucket: &Mutex<Bucket>) -> bool {
        let mut bucket = bucket.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * config.rps).min(config.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (refreshed).
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.rps).min(self.config.burst);
        bucket.last_refill = now;
        bucket.tokens
    }
}

impl Middleware for RateLimiterMiddleware {
    fn name(&self) -> &str {
        "rate_limiter"
    }

    fn wrap(&self, next: PluginHandler) -> PluginHandler {
        let config = self.config.clone();
        let bucket = Arc::clone(&self.bucket);
        Arc::new(move |ctx, req| {
            let next = Arc::clone(&next);
            let config = config.clone();
            let bucket = Arc::clone(&bucket);
            Box::pin(async move {
                if !Self::try_acquire(&config, &bucket) {
                    tracing::debug!(operation = %req.operation, "rate limiter shed plugin call");
                    return Err(PluginError::RateLimited);
                }
                next(ctx, req).await
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
    use std::time::Duration;

    fn counting_handler(calls: Arc<AtomicU32>) -> PluginHandler {
        handler_fn(move |_ctx, _req| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(PluginResponse::new(serde_json::Value::Null))
            }
        })
    }

    #[tokio::test]
    async fn sheds_beyond_burst_without_calling_next() {
        let calls = Arc::new(AtomicU32::new(0));
        let limiter = RateLimiterMiddleware::new(RateLimiterConfig {
            rps: 0.001,
            burst: 3.0,
        });
        let handler = limiter.wrap(counting_handler(Arc::clone(&calls)));

        let mut shed = 0;
        for _ in 0..5 {
            match handler(CallContext::background(), PluginRequest::new("op")).await {
                Ok(_) => {}
                Err(PluginError::RateLimited) => shed += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(shed, 2);
    }

    #[tokio::test]
    async fn refills_over_time() {
        let limiter = RateLimiterMiddleware::new(RateLimiterConfig {
            rps: 100.0,
            burst: 1.0,
        });
        let calls = Arc::new(AtomicU32::new(0));
        let handler = limiter.wrap(counting_handler(Arc::clone(&calls)));

        assert!(handler(CallContext::background(), PluginRequest::new("op"))
            .await
            .is_ok());
        assert!(matches!(
            handler(CallContext::background(), PluginRequest::new("op")).await,
            Err(PluginError::RateLimited)
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handler(CallContext::background(), PluginRequest::new("op"))
            .await
            .is_ok());
    }
}
