//! # Engine Configuration
//!
//! TOML manager config with `STACKDOCTOR_*` environment overrides
//! (double-underscore separates nesting: `STACKDOCTOR_MANAGER__HISTORY_SIZE`).
//!
//! ```toml
//! [manager]
//! history_size = 100
//!
//! [manager.health_check]
//! interval = "30s"
//! timeout = "5s"
//! retries = 3
//!
//! [sandbox]
//! timeout = "30s"
//! memory_limit = "256Mi"
//! allowed_operations = ["ping", "collect_metrics", "get_diagnostic_data"]
//!
//! [[plugins]]
//! name = "cache-main"
//! type = "redis"
//! priority = 5
//!
//! [plugins.connection]
//! host = "127.0.0.1"
//! port = 6379
//!
//! [rules]
//! paths = ["rules/site.json"]
//!
//! [rag]
//! recall_top_k = 100
//! final_top_k = 10
//!
//! [ai]
//! enabled = true
//! base_url = "http://localhost:11434/v1"
//! model = "llama3"
//! ```

use crate::ai::AiConfig;
use crate::analyzers::{MetricThreshold, TrendTarget};
use crate::error::DiagnosisError;
use crate::lifecycle::HealthCheckConfig;
use crate::rag::RagConfig;
use crate::watcher::PluginFileEntry;
use serde::{Deserialize, Serialize};
use stackdoctor_sdk::middleware::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
use stackdoctor_sdk::sandbox::SandboxConfig;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub plugins: Vec<PluginFileEntry>,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub thresholds: Vec<MetricThreshold>,
    #[serde(default)]
    pub trends: Vec<TrendTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Capacity of the diagnosis result FIFO.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Directory watched for per-plugin config files; unset disables hot
    /// reload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_watch_dir: Option<String>,
}

fn default_history_size() -> usize {
    100
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check: HealthCheckConfig::default(),
            history_size: default_history_size(),
            config_watch_dir: None,
        }
    }
}

/// Parameters for the per-plugin resilience chain wrapped around
/// guarded calls: timeout → retry → circuit breaker → rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Per-call deadline enforced by the timeout layer.
    #[serde(
        default = "default_call_timeout",
        with = "stackdoctor_sdk::common::duration_serde"
    )]
    pub call_timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Token bucket; absent disables rate limiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterConfig>,
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RulesConfig {
    /// JSON rule files loaded on top of plugin builtins.
    #[serde(default)]
    pub paths: Vec<String>,
}

impl EngineConfig {
    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: &str) -> Result<Self, DiagnosisError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("STACKDOCTOR").separator("__"))
            .build()
            .map_err(|e| DiagnosisError::config(e.to_string()))?;
        let parsed: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| DiagnosisError::config(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), DiagnosisError> {
        if self.manager.history_size == 0 {
            return Err(DiagnosisError::config("manager.history_size must be > 0"));
        }
        if self.manager.health_check.retries == 0 {
            return Err(DiagnosisError::config(
                "manager.health_check.retries must be > 0",
            ));
        }
        if self.ai.enabled && self.ai.base_url.trim().is_empty() {
            return Err(DiagnosisError::config(
                "ai.base_url is required when ai.enabled = true",
            ));
        }
        if !(0.0..=1.0).contains(&self.ai.clarify_threshold) {
            return Err(DiagnosisError::config(
                "ai.clarify_threshold must be within 0..=1",
            ));
        }
        if self.rag.final_top_k == 0 || self.rag.recall_top_k == 0 {
            return Err(DiagnosisError::config("rag top_k values must be > 0"));
        }
        for threshold in &self.thresholds {
            let bands = [threshold.warning, threshold.error, threshold.critical];
            let mut last: Option<f64> = None;
            for band in bands.into_iter().flatten() {
                if let Some(previous) = last {
                    if band < previous {
                        return Err(DiagnosisError::config(format!(
                            "thresholds for {} must be non-decreasing",
                            threshold.metric
                        )));
                    }
                }
                last = Some(band);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE: &str = r#"
[manager]
history_size = 50

[manager.health_check]
interval = "10s"
timeout = "2s"
retries = 5

[sandbox]
timeout = "20s"
memory_limit = "128Mi"
allowed_operations = ["ping"]

[[plugins]]
name = "cache-main"
type = "redis"
priority = 3

[plugins.connection]
host = "10.0.0.5"
port = 6379

[rules]
paths = ["rules/site.json"]

[rag]
recall_top_k = 40
final_top_k = 5
fusion = "rrf"

[ai]
enabled = true
base_url = "http://localhost:11434/v1"
model = "llama3"
clarify_threshold = 0.4

[[thresholds]]
metric = "connection_usage"
warning = 0.7
error = 0.85
critical = 0.95
"#;

    fn parse(toml_text: &str) -> EngineConfig {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn parses_the_full_sample() {
        let config = parse(SAMPLE);
        assert_eq!(config.manager.history_size, 50);
        assert_eq!(
            config.manager.health_check.interval,
            Duration::from_secs(10)
        );
        assert_eq!(config.manager.health_check.retries, 5);
        assert_eq!(config.plugins.len(), 1);
        assert_eq!(config.plugins[0].name, "cache-main");
        assert_eq!(config.rag.final_top_k, 5);
        assert!(config.ai.enabled);
        assert!((config.ai.clarify_threshold - 0.4).abs() < 1e-12);
        assert_eq!(config.thresholds[0].metric, "connection_usage");
        config.validate().unwrap();
    }

    #[test]
    fn defaults_cover_an_empty_config() {
        let config = parse("");
        assert_eq!(config.manager.history_size, 100);
        assert!(!config.ai.enabled);
        assert_eq!(config.rag.final_top_k, 10);
        config.validate().unwrap();
    }

    #[test]
    fn ai_enabled_requires_a_base_url() {
        let config = parse("[ai]\nenabled = true\n");
        assert!(matches!(
            config.validate(),
            Err(DiagnosisError::Config { .. })
        ));
    }

    #[test]
    fn decreasing_thresholds_are_rejected() {
        let config = parse(
            "[[thresholds]]\nmetric = \"m\"\nwarning = 0.9\nerror = 0.5\n",
        );
        assert!(matches!(
            config.validate(),
            Err(DiagnosisError::Config { .. })
        ));
    }

    #[test]
    fn zero_history_is_rejected() {
        let config = parse("[manager]\nhistory_size = 0\n");
        assert!(config.validate().is_err());
    }
}
