//! # Stackdoctor Engine
//!
//! The diagnosis service built on top of `stackdoctor-sdk`: plugin
//! registry and lifecycle management with background health checks, hot
//! config reload, the rule engine with its expression language, the
//! threshold/anomaly/trend analyzers, the multi-stage RAG retriever, and
//! the AI analyzer with structured-output parsing and multi-turn
//! sessions.
//!
//! ## Architecture
//!
//! - **`registry`** — identity, indexing and state for plugin instances.
//! - **`lifecycle`** — the plugin state machine, health-check tasks and
//!   reload-with-rollback.
//! - **`watcher`** — filesystem-driven hot reload of plugin configs.
//! - **`rules`** — expression language, rule evaluation, rule files.
//! - **`analyzers`** — threshold, anomaly (z-score) and trend
//!   (regression) analysis over collected metrics.
//! - **`engine`** — the orchestrating pipeline producing
//!   [`DiagnosisResult`](stackdoctor_sdk::models::DiagnosisResult)s.
//! - **`rag`** — recall/fusion/rerank retrieval over knowledge stores.
//! - **`ai`** — prompting, parsing/validation, sessions, few-shot.
//! - **`config`** — the TOML manager configuration.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stackdoctor_engine::engine::DiagnosisEngineBuilder;
//! use stackdoctor_engine::registry::PluginRegistry;
//! use stackdoctor_sdk::adapters::RedisPluginFactory;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(PluginRegistry::new());
//! registry.register_factory(Arc::new(RedisPluginFactory))?;
//! let engine = DiagnosisEngineBuilder::new(registry).build();
//! ```

pub mod ai;
pub mod analyzers;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod rag;
pub mod registry;
pub mod rules;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::EngineConfig;
pub use engine::{DiagnosisEngine, DiagnosisEngineBuilder};
pub use error::DiagnosisError;
pub use lifecycle::{HealthCheckConfig, LifecycleManager};
pub use registry::{PluginInstance, PluginRegistry};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, DiagnosisError>;
