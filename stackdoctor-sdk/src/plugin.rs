//! # Middleware Plugin Contract
//!
//! This module defines the primary extension boundary of Stackdoctor: the
//! [`MiddlewarePlugin`] trait every middleware adapter implements, the
//! configuration types fed to it, and the [`PluginFactory`] used by the
//! registry to instantiate plugins from configuration.
//!
//! ## Dispatch model
//!
//! First-party middlewares are a closed sum ([`MiddlewareType`]) with an
//! `Other(String)` escape hatch; the registry itself is keyed by the
//! string form, so third-party plugins register without touching this
//! enum. Dispatch is always through `Arc<dyn MiddlewarePlugin>` — no
//! reflection, no downcasting.
//!
//! ## State machine
//!
//! [`PluginState`] transitions are owned exclusively by the engine's
//! lifecycle manager:
//!
//! ```text
//! Uninitialized ─init──▶ Initializing ─start──▶ Running
//!      ▲  ▲                  │                    │
//!      │  └─ init/start fail ▼                    │ stop
//!   unregister            Error  ◀── health-fail ─┤
//!                             │                   ▼
//!                             └─── re-init ──▶ Stopping ──▶ Stopped
//! ```

use crate::context::CallContext;
use crate::error::PluginError;
use crate::models::{
    Command, CommandResult, CommandSpec, DiagnosisRule, DiagnosticData, MetricValue,
    MetricsSnapshot,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Broad classification of a plugin's purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Middleware,
    Diagnostic,
    Action,
    Integration,
}

/// The middlewares Stackdoctor ships first-party adapters for, plus an
/// open string variant for external plugins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MiddlewareType {
    Redis,
    MySql,
    Kafka,
    Elasticsearch,
    Postgres,
    Other(String),
}

impl MiddlewareType {
    pub fn as_str(&self) -> &str {
        match self {
            MiddlewareType::Redis => "redis",
            MiddlewareType::MySql => "mysql",
            MiddlewareType::Kafka => "kafka",
            MiddlewareType::Elasticsearch => "elasticsearch",
            MiddlewareType::Postgres => "postgresql",
            MiddlewareType::Other(name) => name.as_str(),
        }
    }
}

impl FromStr for MiddlewareType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "redis" => MiddlewareType::Redis,
            "mysql" => MiddlewareType::MySql,
            "kafka" => MiddlewareType::Kafka,
            "elasticsearch" | "es" => MiddlewareType::Elasticsearch,
            "postgresql" | "postgres" | "pg" => MiddlewareType::Postgres,
            other => MiddlewareType::Other(other.to_string()),
        })
    }
}

impl fmt::Display for MiddlewareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MiddlewareType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MiddlewareType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().expect("middleware type parse is infallible"))
    }
}

/// Identity and capabilities of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub plugin_type: PluginType,
    pub middleware_type: MiddlewareType,
    #[serde(default)]
    pub supported_versions: Vec<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Plugin ids this plugin depends on.
    #[serde(default)]
    pub requires: BTreeSet<String>,
}

/// Connection parameters handed to `connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_connect_timeout", with = "crate::common::duration_serde")]
    pub timeout: Duration,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_pool_size() -> u32 {
    4
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            username: None,
            password: None,
            tls: false,
            timeout: default_connect_timeout(),
            pool_size: default_pool_size(),
            database: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Per-plugin configuration as loaded from the manager config or a
/// watched config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "type")]
    pub middleware_type: MiddlewareType,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_enabled() -> bool {
    true
}

/// Lifecycle state of a registered plugin. Transitions happen only inside
/// the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Uninitialized,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl PluginState {
    /// Whether `init` may be called from this state.
    pub fn can_init(&self) -> bool {
        matches!(
            self,
            PluginState::Uninitialized | PluginState::Stopped | PluginState::Error
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Uninitialized => "uninitialized",
            PluginState::Initializing => "initializing",
            PluginState::Running => "running",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
            PluginState::Error => "error",
        };
        f.write_str(s)
    }
}

/// The contract every middleware adapter implements.
///
/// Implementations own their client and connection pool exclusively and
/// are responsible for internal thread-safety; the trait takes `&self`
/// so instances can live behind `Arc`.
#[async_trait::async_trait]
pub trait MiddlewarePlugin: Send + Sync {
    /// Identity and capabilities. Must be cheap.
    fn info(&self) -> PluginInfo;

    /// Establish the backend connection. Idempotent: reconnecting replaces
    /// the previous client.
    async fn connect(&self, ctx: &CallContext, config: &ConnectionConfig)
        -> Result<(), PluginError>;

    /// Tear down the backend connection.
    async fn disconnect(&self, ctx: &CallContext) -> Result<(), PluginError>;

    /// Liveness probe used by the health checker.
    async fn ping(&self, ctx: &CallContext) -> Result<(), PluginError>;

    fn is_connected(&self) -> bool;

    /// Collect the full metrics snapshot for this middleware.
    async fn collect_metrics(&self, ctx: &CallContext) -> Result<MetricsSnapshot, PluginError>;

    /// Collect a single metric by name. Optional; the default declines.
    async fn collect_specific_metric(
        &self,
        ctx: &CallContext,
        name: &str,
    ) -> Result<MetricValue, PluginError> {
        let _ = ctx;
        Err(PluginError::Unsupported {
            operation: format!("collect_specific_metric({name})"),
        })
    }

    /// Execute a command. Implementations enforce their blocked-command
    /// deny list before touching the backend, and dry-run never mutates.
    async fn execute(&self, ctx: &CallContext, command: Command)
        -> Result<CommandResult, PluginError>;

    fn supported_commands(&self) -> Vec<CommandSpec>;

    /// Build the immutable per-request diagnostic aggregate.
    async fn get_diagnostic_data(&self, ctx: &CallContext) -> Result<DiagnosticData, PluginError>;

    /// Rules this adapter ships out of the box.
    fn builtin_rules(&self) -> Vec<DiagnosisRule> {
        Vec::new()
    }
}

/// Creates plugins of one middleware type from configuration. Registered
/// with the engine registry under `MiddlewareType::as_str()`.
pub trait PluginFactory: Send + Sync {
    fn middleware_type(&self) -> MiddlewareType;

    fn create(&self, config: &PluginConfig) -> Result<Arc<dyn MiddlewarePlugin>, PluginError>;
}
