//! # Plugin Lifecycle Manager
//!
//! Enforces the plugin state machine and runs per-plugin background
//! health checks.
//!
//! ```text
//! Uninitialized ─init──▶ Initializing ─start──▶ Running
//!      ▲  ▲                  │                    │
//!      │  └─ init/start fail ▼                    │ stop
//!   unregister            Error  ◀── health-fail ─┤
//!                             │                   ▼
//!                             └─── re-init ──▶ Stopping ──▶ Stopped
//! ```
//!
//! Contracts:
//!
//! - `init` is valid only from Uninitialized / Stopped / Error.
//! - `start` is valid only from Initializing; success launches the
//!   health-check task, failure moves to Error and fires `on_error`.
//! - `reload` is stop → init → start. The prior config is snapshotted and
//!   re-applied best-effort when the new config fails; a second failure
//!   leaves the plugin in Error with both causes logged.
//! - `stop_all` stops in reverse registration order and awaits every
//!   background task before returning.
//!
//! The health loop pings with a per-check timeout. `fail_count` resets on
//! success; on `retries` consecutive failures the plugin transitions to
//! Error and `on_unhealthy` fires exactly once (the transition guard
//! suppresses repeats while the plugin stays in Error). The task exits
//! within one tick of its stop signal.

use crate::error::DiagnosisError;
use crate::registry::PluginRegistry;
use serde::{Deserialize, Serialize};
use stackdoctor_sdk::context::CallContext;
use stackdoctor_sdk::plugin::{PluginConfig, PluginState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Interval between pings.
    #[serde(with = "stackdoctor_sdk::common::duration_serde")]
    pub interval: Duration,
    /// Per-ping timeout.
    #[serde(with = "stackdoctor_sdk::common::duration_serde")]
    pub timeout: Duration,
    /// Consecutive failures before the plugin is marked unhealthy.
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 3,
        }
    }
}

/// Observer invoked with the plugin name and a failure description.
pub type LifecycleHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_error: Vec<LifecycleHook>,
    on_unhealthy: Vec<LifecycleHook>,
}

struct HealthTask {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

pub struct LifecycleManager {
    registry: Arc<PluginRegistry>,
    health: HealthCheckConfig,
    tasks: Mutex<HashMap<String, HealthTask>>,
    hooks: std::sync::Mutex<Hooks>,
    /// Last successfully applied config per plugin, for reload rollback.
    prior_configs: std::sync::Mutex<HashMap<String, PluginConfig>>,
}

impl LifecycleManager {
    pub fn new(registry: Arc<PluginRegistry>, health: HealthCheckConfig) -> Self {
        Self {
            registry,
            health,
            tasks: Mutex::new(HashMap::new()),
            hooks: std::sync::Mutex::new(Hooks::default()),
            prior_configs: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn on_error(&self, hook: LifecycleHook) {
        self.hooks.lock().expect("hook lock poisoned").on_error.push(hook);
    }

    pub fn on_unhealthy(&self, hook: LifecycleHook) {
        self.hooks
            .lock()
            .expect("hook lock poisoned")
            .on_unhealthy
            .push(hook);
    }

    fn fire_on_error(&self, name: &str, message: &str) {
        let hooks = self.hooks.lock().expect("hook lock poisoned");
        for hook in &hooks.on_error {
            hook(name, message);
        }
    }

    fn fire_on_unhealthy(&self, name: &str, message: &str) {
        let hooks = self.hooks.lock().expect("hook lock poisoned");
        for hook in &hooks.on_unhealthy {
            hook(name, message);
        }
    }

    /// (Re-)initialize a plugin: connect it with the given config and
    /// move it to Initializing. Valid from Uninitialized, Stopped and
    /// Error only.
    pub async fn init(&self, name: &str, config: PluginConfig) -> Result<(), DiagnosisError> {
        let instance = self.registry.instance_of(name)?;
        if !instance.state.can_init() {
            return Err(DiagnosisError::InvalidTransition {
                name: name.to_string(),
                from: instance.state,
                to: PluginState::Initializing,
            });
        }

        self.registry
            .set_state(name, PluginState::Initializing, None)?;
        let ctx = CallContext::with_timeout(config.connection.timeout);
        match instance.plugin.connect(&ctx, &config.connection).await {
            Ok(()) => {
                self.registry.update_config(name, config)?;
                tracing::info!(plugin = name, "plugin initialized");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.registry
                    .set_state(name, PluginState::Error, Some(message.clone()))?;
                self.fire_on_error(name, &message);
                tracing::error!(plugin = name, error = %message, "plugin init failed");
                Err(err.into())
            }
        }
    }

    /// Move an Initializing plugin to Running and launch its health
    /// checker.
    pub async fn start(&self, name: &str) -> Result<(), DiagnosisError> {
        let instance = self.registry.instance_of(name)?;
        if instance.state != PluginState::Initializing {
            return Err(DiagnosisError::InvalidTransition {
                name: name.to_string(),
                from: instance.state,
                to: PluginState::Running,
            });
        }

        // Verify liveness before declaring the plugin Running.
        let ctx = CallContext::with_timeout(self.health.timeout);
        if let Err(err) = instance.plugin.ping(&ctx).await {
            let message = err.to_string();
            self.registry
                .set_state(name, PluginState::Error, Some(message.clone()))?;
            self.fire_on_error(name, &message);
            tracing::error!(plugin = name, error = %message, "plugin start failed");
            return Err(err.into());
        }

        self.registry.set_state(name, PluginState::Running, None)?;
        self.prior_configs
            .lock()
            .expect("config lock poisoned")
            .insert(name.to_string(), instance.config.clone());
        self.spawn_health_task(name).await;
        tracing::info!(plugin = name, "plugin running");
        Ok(())
    }

    /// Convenience: init followed by start.
    pub async fn init_and_start(
        &self,
        name: &str,
        config: PluginConfig,
    ) -> Result<(), DiagnosisError> {
        self.init(name, config).await?;
        self.start(name).await
    }

    /// Stop a plugin: cancel its health task, disconnect, move to
    /// Stopped.
    pub async fn stop(&self, name: &str) -> Result<(), DiagnosisError> {
        let instance = self.registry.instance_of(name)?;
        match instance.state {
            PluginState::Stopped | PluginState::Uninitialized => return Ok(()),
            _ => {}
        }

        self.registry.set_state(name, PluginState::Stopping, None)?;
        self.cancel_health_task(name).await;

        let ctx = CallContext::with_timeout(self.health.timeout);
        if let Err(err) = instance.plugin.disconnect(&ctx).await {
            tracing::warn!(plugin = name, error = %err, "disconnect failed during stop");
        }
        self.registry.set_state(name, PluginState::Stopped, None)?;
        tracing::info!(plugin = name, "plugin stopped");
        Ok(())
    }

    /// Stop-then-init-then-start with the new config. On failure the
    /// previous config is re-applied best-effort.
    pub async fn reload(&self, name: &str, config: PluginConfig) -> Result<(), DiagnosisError> {
        let prior = self
            .prior_configs
            .lock()
            .expect("config lock poisoned")
            .get(name)
            .cloned();

        self.stop(name).await?;
        match self.init_and_start_inner(name, config).await {
            Ok(()) => {
                tracing::info!(plugin = name, "plugin reloaded");
                Ok(())
            }
            Err(err) => {
                tracing::error!(plugin = name, error = %err, "reload failed; attempting rollback");
                if let Some(prior) = prior {
                    if let Err(rollback_err) = self.init_and_start_inner(name, prior).await {
                        tracing::error!(
                            plugin = name,
                            error = %rollback_err,
                            "rollback to prior config also failed"
                        );
                    } else {
                        tracing::warn!(plugin = name, "rolled back to prior config");
                    }
                }
                Err(err)
            }
        }
    }

    async fn init_and_start_inner(
        &self,
        name: &str,
        config: PluginConfig,
    ) -> Result<(), DiagnosisError> {
        self.init(name, config).await?;
        self.start(name).await
    }

    /// Stop every plugin in reverse registration order and wait for all
    /// background tasks.
    pub async fn stop_all(&self) {
        let order = self.registry.registration_order();
        for name in order.iter().rev() {
            if let Err(err) = self.stop(name).await {
                tracing::warn!(plugin = %name, error = %err, "stop failed during shutdown");
            }
        }
        // Stop() already awaited each task; drain anything left over.
        let mut tasks = self.tasks.lock().await;
        for (name, task) in tasks.drain() {
            task.stop.cancel();
            if let Err(err) = task.handle.await {
                if !err.is_cancelled() {
                    tracing::warn!(plugin = %name, error = %err, "health task join failed");
                }
            }
        }
        tracing::info!("all plugins stopped");
    }

    async fn spawn_health_task(&self, name: &str) {
        // Replace any stale task for this plugin first.
        self.cancel_health_task(name).await;

        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let registry = Arc::clone(&self.registry);
        let health = self.health.clone();
        let plugin_name = name.to_string();
        let hooks: Vec<LifecycleHook> = self
            .hooks
            .lock()
            .expect("hook lock poisoned")
            .on_unhealthy
            .clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a freshly
            // started plugin is not pinged twice in a row.
            ticker.tick().await;

            let mut fail_count: u32 = 0;
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Ok(instance) = registry.instance_of(&plugin_name) else {
                    break;
                };
                let ctx = CallContext::with_timeout(health.timeout);
                match instance.plugin.ping(&ctx).await {
                    Ok(()) => {
                        if fail_count > 0 {
                            tracing::debug!(plugin = %plugin_name, "health restored");
                        }
                        fail_count = 0;
                    }
                    Err(err) => {
                        fail_count += 1;
                        tracing::warn!(
                            plugin = %plugin_name,
                            fail_count,
                            error = %err,
                            "health check failed"
                        );
                        if fail_count >= health.retries {
                            let message = format!(
                                "{fail_count} consecutive health check failures: {err}"
                            );
                            let was_running = registry
                                .state_of(&plugin_name)
                                .map(|s| s == PluginState::Running)
                                .unwrap_or(false);
                            if was_running {
                                let _ = registry.set_state(
                                    &plugin_name,
                                    PluginState::Error,
                                    Some(message.clone()),
                                );
                                for hook in &hooks {
                                    hook(&plugin_name, &message);
                                }
                            }
                            fail_count = 0;
                        }
                    }
                }
            }
        });

        self.tasks
            .lock()
            .await
            .insert(name.to_string(), HealthTask { handle, stop });
    }

    async fn cancel_health_task(&self, name: &str) {
        let task = self.tasks.lock().await.remove(name);
        if let Some(task) = task {
            task.stop.cancel();
            if let Err(err) = task.handle.await {
                if !err.is_cancelled() {
                    tracing::warn!(plugin = name, error = %err, "health task join failed");
                }
            }
        }
    }
}
