//! # Circuit Breaker Middleware
//!
//! Prevents cascading failures by shedding calls to a plugin that keeps
//! failing, then probing it for recovery.
//!
//! ## States
//!
//! - **Closed** — calls pass through; outcomes are recorded into a
//!   rolling window. The breaker trips to Open when the window holds at
//!   least `min_requests` outcomes AND the failure ratio meets
//!   `failure_ratio`.
//! - **Open** — calls are rejected with [`PluginError::CircuitOpen`]
//!   without touching the plugin. After `open_timeout` the breaker moves
//!   to HalfOpen.
//! - **HalfOpen** — at most `probe_max` calls may be in flight
//!   concurrently. A successful probe closes the breaker and clears the
//!   window; a failed probe re-opens it.

use super::{Middleware, PluginHandler};
use crate::error::PluginError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Circuit breaker operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Rolling window over which the failure ratio is computed.
    #[serde(with = "crate::common::duration_serde")]
    pub window: Duration,
    /// Minimum outcomes in the window before the breaker may trip.
    pub min_requests: u32,
    /// Failure ratio (0..=1) at which the breaker trips.
    pub failure_ratio: f64,
    /// How long the breaker stays open before probing.
    #[serde(with = "crate::common::duration_serde")]
    pub open_timeout: Duration,
    /// Maximum concurrent probes in half-open state.
    pub probe_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_requests: 10,
            failure_ratio: 0.5,
            open_timeout: Duration::from_secs(30),
            probe_max: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// (when, success) outcomes inside the rolling window.
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            outcomes: VecDeque::new(),
            opened_at: None,
            half_open_inflight: 0,
        }
    }
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub window_requests: u32,
    pub window_failures: u32,
}

struct BreakerCore {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl BreakerCore {
    fn prune(&self, state: &mut BreakerState, now: Instant) {
        while let Some((when, _)) = state.outcomes.front() {
            if now.duration_since(*when) > self.config.window {
                state.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admission decision. Updates half-open bookkeeping when a probe is
    /// admitted.
    fn try_acquire(&self) -> Result<(), PluginError> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened = state.opened_at.unwrap_or(now);
                if now.duration_since(opened) >= self.config.open_timeout {
                    state.state = CircuitState::HalfOpen;
                    state.half_open_inflight = 1;
                    tracing::info!(breaker = %self.name, "circuit breaker transitioning to HALF-OPEN");
                    Ok(())
                } else {
                    Err(PluginError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_inflight < self.config.probe_max {
                    state.half_open_inflight += 1;
                    Ok(())
                } else {
                    Err(PluginError::CircuitOpen)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        match state.state {
            CircuitState::Closed => {
                state.outcomes.push_back((now, true));
                self.prune(&mut state, now);
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Closed;
                state.outcomes.clear();
                state.opened_at = None;
                state.half_open_inflight = 0;
                tracing::info!(breaker = %self.name, "circuit breaker transitioning to CLOSED");
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        match state.state {
            CircuitState::Closed => {
                state.outcomes.push_back((now, false));
                self.prune(&mut state, now);
                let total = state.outcomes.len() as u32;
                let failures = state.outcomes.iter().filter(|(_, ok)| !ok).count() as u32;
                if total >= self.config.min_requests
                    && f64::from(failures) / f64::from(total) >= self.config.failure_ratio
                {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    tracing::warn!(
                        breaker = %self.name,
                        failures,
                        total,
                        "circuit breaker transitioning to OPEN"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.half_open_inflight = 0;
                tracing::warn!(breaker = %self.name, "circuit breaker transitioning back to OPEN");
            }
            CircuitState::Open => {}
        }
    }

    fn release_probe(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if state.state == CircuitState::HalfOpen && state.half_open_inflight > 0 {
            state.half_open_inflight -= 1;
        }
    }
}

pub struct CircuitBreakerMiddleware {
    core: Arc<BreakerCore>,
}

impl CircuitBreakerMiddleware {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            core: Arc::new(BreakerCore {
                name: name.into(),
                config,
                state: Mutex::new(BreakerState::default()),
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.core.state.lock().expect("breaker lock poisoned").state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.core.state.lock().expect("breaker lock poisoned");
        CircuitBreakerMetrics {
            name: self.core.name.clone(),
            state: state.state,
            window_requests: state.outcomes.len() as u32,
            window_failures: state.outcomes.iter().filter(|(_, ok)| !ok).count() as u32,
        }
    }

    /// Manually open the breaker (testing / emergency shedding).
    pub fn force_open(&self) {
        let mut state = self.core.state.lock().expect("breaker lock poisoned");
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
    }

    /// Manually reset the breaker.
    pub fn force_closed(&self) {
        let mut state = self.core.state.lock().expect("breaker lock poisoned");
        *state = BreakerState::default();
    }
}

impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    fn wrap(&self, next: PluginHandler) -> PluginHandler {
        let core = Arc::clone(&self.core);
        Arc::new(move |ctx, req| {
            let next = Arc::clone(&next);
            let core = Arc::clone(&core);
            Box::pin(async move {
                core.try_acquire()?;
                let was_half_open = {
                    let state = core.state.lock().expect("breaker lock poisoned");
                    state.state == CircuitState::HalfOpen
                };

                let result = next(ctx, req).await;
                match &result {
                    Ok(_) => core.on_success(),
                    // Cancellation says nothing about plugin health.
                    Err(PluginError::Cancelled) => {
                        if was_half_open {
                            core.release_probe();
                        }
                    }
                    Err(_) => core.on_failure(),
                }
                result
            })
        })
    }
}
