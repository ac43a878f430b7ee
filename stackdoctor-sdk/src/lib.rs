//! # Stackdoctor SDK
//!
//! The extension-facing library of the Stackdoctor diagnosis engine: the
//! middleware plugin contract, the shared data model, the resilience
//! middleware chain, the sandbox, reference adapters for the supported
//! middlewares, and the LLM adapter abstraction.
//!
//! ## Overview
//!
//! Stackdoctor diagnoses stateful middleware (Redis, MySQL, Kafka,
//! Elasticsearch, PostgreSQL) by collecting metrics, configuration, slow
//! queries, connections and replication state through a per-middleware
//! plugin, then evaluating rules and analyzers over the collected
//! snapshot. This crate holds everything a plugin author or embedder
//! needs:
//!
//! - **`plugin`** — the [`MiddlewarePlugin`](plugin::MiddlewarePlugin)
//!   trait, plugin configuration and the state machine type.
//! - **`models`** — metrics, diagnostic data, issues, rules, results and
//!   retrieval types shared with the engine.
//! - **`middleware`** — the timeout / retry / circuit-breaker /
//!   rate-limit chain wrapped around every plugin call.
//! - **`sandbox`** — allow-listed, deadline-bound, panic-recovering
//!   execution of plugin actions.
//! - **`adapters`** — reference adapters with the documented metric
//!   derivations for each supported middleware.
//! - **`llm`** — the LLM adapter trait plus an OpenAI-compatible HTTP
//!   implementation.
//! - **`context`** — the deadline + cancellation carrier threaded
//!   through every I/O call.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stackdoctor_sdk::adapters::RedisPlugin;
//! use stackdoctor_sdk::context::CallContext;
//! use stackdoctor_sdk::plugin::{ConnectionConfig, MiddlewarePlugin};
//!
//! let plugin = RedisPlugin::new();
//! let ctx = CallContext::with_timeout(std::time::Duration::from_secs(10));
//! plugin.connect(&ctx, &ConnectionConfig {
//!     host: "127.0.0.1".into(),
//!     port: 6379,
//!     ..Default::default()
//! }).await?;
//! let data = plugin.get_diagnostic_data(&ctx).await?;
//! ```

pub mod adapters;
pub mod common;
pub mod context;
pub mod error;
pub mod guard;
pub mod llm;
pub mod middleware;
pub mod models;
pub mod plugin;
pub mod sandbox;

pub use context::CallContext;
pub use error::PluginError;
pub use guard::GuardedPlugin;
pub use llm::{ChatMessage, ChatRequest, ChatResponse, LlmAdapter};
pub use models::{
    DiagnoseOptions, DiagnosisRequest, DiagnosisResult, DiagnosisRule, DiagnosisStatus,
    DiagnosticData, HealthStatus, Issue, KnowledgeDocument, MetricValue, MetricsSnapshot,
    RetrievalResult, RetrievalSource, Severity,
};
pub use plugin::{
    ConnectionConfig, MiddlewarePlugin, MiddlewareType, PluginConfig, PluginFactory, PluginInfo,
    PluginState, PluginType,
};
pub use sandbox::{Sandbox, SandboxConfig};

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, PluginError>;
