//! Z-score anomaly analyzer.
//!
//! Compares each current metric against its mean and standard deviation
//! over a 24 h history window. Requires at least [`MIN_POINTS`] samples;
//! a zero standard deviation is treated as 1.0 to avoid dividing by zero
//! on perfectly flat series.

use super::Analyzer;
use crate::error::DiagnosisError;
use crate::history::MetricsHistoryStore;
use stackdoctor_sdk::models::{DiagnosticData, Issue, Severity};
use std::sync::Arc;
use std::time::Duration;

pub const MIN_POINTS: usize = 10;
const DEFAULT_SENSITIVITY: f64 = 3.0;

pub struct AnomalyAnalyzer {
    store: Arc<dyn MetricsHistoryStore>,
    window: Duration,
    /// Z-score magnitude above which a metric is flagged.
    sensitivity: f64,
}

impl AnomalyAnalyzer {
    pub fn new(store: Arc<dyn MetricsHistoryStore>) -> Self {
        Self {
            store,
            window: Duration::from_secs(24 * 3600),
            sensitivity: DEFAULT_SENSITIVITY,
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

fn mean_and_stddev(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[async_trait::async_trait]
impl Analyzer for AnomalyAnalyzer {
    fn name(&self) -> &'static str {
        "anomaly"
    }

    async fn analyze(
        &self,
        instance: &str,
        data: &DiagnosticData,
    ) -> Result<Vec<Issue>, DiagnosisError> {
        let mut issues = Vec::new();
        for (name, metric) in data.metrics.metrics() {
            let points = self.store.query(instance, name, self.window);
            if points.len() < MIN_POINTS {
                continue;
            }
            let values: Vec<f64> = points.iter().map(|p| p.value).collect();
            let (mean, stddev) = mean_and_stddev(&values);
            let stddev = if stddev == 0.0 { 1.0 } else { stddev };

            let current = metric.value.as_f64();
            let z = (current - mean) / stddev;
            if z.abs() > self.sensitivity {
                issues.push(
                    Issue::new(
                        format!("anomaly-{name}"),
                        format!("{name} Anomaly"),
                        Severity::Warning,
                    )
                    .with_description(format!(
                        "{name} is {current:.3}, {z:.1} standard deviations from its 24h mean {mean:.3}"
                    ))
                    .with_category("anomaly")
                    .with_evidence(name.clone(), serde_json::json!(current))
                    .with_evidence("z_score", serde_json::json!(z))
                    .with_evidence("mean", serde_json::json!(mean)),
                );
            }
        }
        Ok(issues)
    }
}
