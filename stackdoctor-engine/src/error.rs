//! Engine-level error taxonomy.
//!
//! Wraps the SDK's [`PluginError`] and adds the registry, lifecycle,
//! rule-engine and AI-output error kinds. Propagation policy: per-rule
//! and per-analyzer failures are recovered locally and logged; a plugin
//! I/O failure while building the diagnostic snapshot aborts the request
//! with `DiagnosisFailed`; an LLM failure aborts only the AI phase.

use stackdoctor_sdk::plugin::PluginState;
use stackdoctor_sdk::PluginError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiagnosisError {
    /// Wrapped plugin I/O errors
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// No plugin or instance under this name
    #[error("not found: {name}")]
    NotFound { name: String },

    /// A factory or instance already exists under this name
    #[error("already registered: {name}")]
    AlreadyRegistered { name: String },

    /// The instance is running and cannot be unregistered
    #[error("plugin in use: {name}")]
    InUse { name: String },

    /// No factory registered for the requested middleware type
    #[error("no factory for middleware type: {middleware}")]
    FactoryMissing { middleware: String },

    /// A lifecycle operation was attempted from the wrong state
    #[error("invalid state transition for {name}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: PluginState,
        to: PluginState,
    },

    /// The diagnosis request failed as a whole
    #[error("diagnosis failed: {message}")]
    DiagnosisFailed { message: String },

    /// An analyzer failed; recorded and recovered per-analyzer
    #[error("analysis failed: {message}")]
    AnalysisFailed { message: String },

    /// A rule failed to compile or evaluate; recovered per-rule
    #[error("rule {rule_id} failed: {message}")]
    Rule { rule_id: String, message: String },

    /// Configuration load or validation failure
    #[error("config error: {message}")]
    Config { message: String },

    /// AI output could not be parsed into the expected shape
    #[error("ai output parse error: {message}")]
    Parse { message: String },

    /// AI output parsed but failed schema validation
    #[error("ai output validation error: {message}")]
    Validation { message: String },

    /// Template rendering failure
    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DiagnosisError {
    pub fn config(message: impl Into<String>) -> Self {
        DiagnosisError::Config {
            message: message.into(),
        }
    }

    pub fn rule(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        DiagnosisError::Rule {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        DiagnosisError::Parse {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DiagnosisError::Validation {
            message: message.into(),
        }
    }
}
