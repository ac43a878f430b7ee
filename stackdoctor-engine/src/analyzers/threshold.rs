//! Static threshold analyzer.
//!
//! For each configured metric, emits the highest severity whose threshold
//! the current value meets or exceeds. Thresholds are assumed strictly
//! increasing (warning < error < critical); a value equal to two
//! thresholds resolves to the higher severity because critical is checked
//! first.

use super::Analyzer;
use crate::error::DiagnosisError;
use serde::{Deserialize, Serialize};
use stackdoctor_sdk::models::{DiagnosticData, Issue, Severity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<f64>,
}

impl MetricThreshold {
    fn classify(&self, value: f64) -> Option<Severity> {
        if let Some(critical) = self.critical {
            if value >= critical {
                return Some(Severity::Critical);
            }
        }
        if let Some(error) = self.error {
            if value >= error {
                return Some(Severity::Error);
            }
        }
        if let Some(warning) = self.warning {
            if value >= warning {
                return Some(Severity::Warning);
            }
        }
        None
    }

    fn crossed_threshold(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Critical => self.critical.unwrap_or_default(),
            Severity::Error => self.error.unwrap_or_default(),
            _ => self.warning.unwrap_or_default(),
        }
    }
}

pub struct ThresholdAnalyzer {
    thresholds: Vec<MetricThreshold>,
}

impl ThresholdAnalyzer {
    pub fn new(thresholds: Vec<MetricThreshold>) -> Self {
        Self { thresholds }
    }
}

#[async_trait::async_trait]
impl Analyzer for ThresholdAnalyzer {
    fn name(&self) -> &'static str {
        "threshold"
    }

    async fn analyze(
        &self,
        _instance: &str,
        data: &DiagnosticData,
    ) -> Result<Vec<Issue>, DiagnosisError> {
        let mut issues = Vec::new();
        for threshold in &self.thresholds {
            let Some(value) = data.metrics.value(&threshold.metric) else {
                continue;
            };
            let Some(severity) = threshold.classify(value) else {
                continue;
            };
            let crossed = threshold.crossed_threshold(severity);
            issues.push(
                Issue::new(
                    format!("threshold-{}", threshold.metric),
                    format!("{} Threshold Exceeded", threshold.metric),
                    severity,
                )
                .with_description(format!(
                    "{} is {value}, at or above the {} threshold {crossed}",
                    threshold.metric,
                    severity.as_str()
                ))
                .with_category("threshold")
                .with_evidence(threshold.metric.clone(), serde_json::json!(value)),
            );
        }
        Ok(issues)
    }
}
