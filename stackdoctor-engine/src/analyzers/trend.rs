//! Linear-trend analyzer.
//!
//! Fits a least-squares line through each configured metric's history
//! (x = seconds since the first sample) and projects the value
//! [`PROJECTION_HORIZON`] ahead. A metric is flagged when the projection
//! crosses its configured danger level and the slope exceeds the
//! configured minimum positive slope — a flat or falling series never
//! fires, however close to the danger level it sits.

use super::Analyzer;
use crate::error::DiagnosisError;
use crate::history::{MetricPoint, MetricsHistoryStore};
use serde::{Deserialize, Serialize};
use stackdoctor_sdk::models::{DiagnosticData, Issue, Severity};
use std::sync::Arc;
use std::time::Duration;

/// How far ahead the regression line is projected.
pub const PROJECTION_HORIZON: Duration = Duration::from_secs(30 * 60);

const MIN_POINTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendTarget {
    pub metric: String,
    /// Projected value at which the metric becomes dangerous.
    pub danger_level: f64,
    /// Minimum positive slope (units per second) for a trend to count.
    pub min_slope: f64,
}

pub struct TrendAnalyzer {
    store: Arc<dyn MetricsHistoryStore>,
    targets: Vec<TrendTarget>,
    window: Duration,
}

impl TrendAnalyzer {
    pub fn new(store: Arc<dyn MetricsHistoryStore>, targets: Vec<TrendTarget>) -> Self {
        Self {
            store,
            targets,
            window: Duration::from_secs(3600),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Least-squares fit over (seconds-since-first-sample, value). Returns
/// (slope, intercept), or `None` when the series is degenerate.
fn linear_fit(points: &[MetricPoint]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let t0 = points.first()?.timestamp;
    let xs: Vec<f64> = points
        .iter()
        .map(|p| (p.timestamp - t0).num_milliseconds() as f64 / 1000.0)
        .collect();
    let ys: Vec<f64> = points.iter().map(|p| p.value).collect();

    let n = xs.len() as f64;
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xy: f64 = xs.iter().zip(&ys).map(|(x, y)| x * y).sum();
    let sum_xx: f64 = xs.iter().map(|x| x * x).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}

#[async_trait::async_trait]
impl Analyzer for TrendAnalyzer {
    fn name(&self) -> &'static str {
        "trend"
    }

    async fn analyze(
        &self,
        instance: &str,
        _data: &DiagnosticData,
    ) -> Result<Vec<Issue>, DiagnosisError> {
        let mut issues = Vec::new();
        for target in &self.targets {
            let points = self.store.query(instance, &target.metric, self.window);
            if points.len() < MIN_POINTS {
                continue;
            }
            let Some((slope, intercept)) = linear_fit(&points) else {
                continue;
            };
            if slope <= target.min_slope {
                continue;
            }

            let t0 = points[0].timestamp;
            let last_x = (points[points.len() - 1].timestamp - t0).num_milliseconds() as f64 / 1000.0;
            let projected = intercept + slope * (last_x + PROJECTION_HORIZON.as_secs_f64());
            if projected >= target.danger_level {
                issues.push(
                    Issue::new(
                        format!("trend-{}", target.metric),
                        format!("{} Trending Toward Danger Level", target.metric),
                        Severity::Warning,
                    )
                    .with_description(format!(
                        "{} is projected to reach {projected:.1} within 30 minutes (danger level {})",
                        target.metric, target.danger_level
                    ))
                    .with_category("trend")
                    .with_evidence("slope_per_second", serde_json::json!(slope))
                    .with_evidence("projected", serde_json::json!(projected)),
                );
            }
        }
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistoryStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use stackdoctor_sdk::models::MetricsSnapshot;

    fn store_with_slope(metric: &str, start: f64, per_minute: f64) -> Arc<InMemoryHistoryStore> {
        let store = Arc::new(InMemoryHistoryStore::default());
        let t0 = Utc::now() - ChronoDuration::minutes(30);
        for i in 0..30 {
            store.record_point(
                "db-1",
                metric,
                MetricPoint {
                    timestamp: t0 + ChronoDuration::minutes(i),
                    value: start + per_minute * i as f64,
                },
            );
        }
        store
    }

    fn empty_data() -> DiagnosticData {
        DiagnosticData::new(MetricsSnapshot::empty())
    }

    fn target(metric: &str, danger: f64) -> TrendTarget {
        TrendTarget {
            metric: metric.to_string(),
            danger_level: danger,
            min_slope: 0.0001,
        }
    }

    #[tokio::test]
    async fn rising_metric_projected_past_danger_fires() {
        // 2 units/minute from 50: currently ~110, projected +60 in 30 min.
        let store = store_with_slope("connections", 50.0, 2.0);
        let analyzer = TrendAnalyzer::new(store, vec![target("connections", 150.0)]);

        let issues = analyzer.analyze("db-1", &empty_data()).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].description.contains("30 minutes"));
    }

    #[tokio::test]
    async fn rising_metric_below_danger_does_not_fire() {
        let store = store_with_slope("connections", 50.0, 0.1);
        let analyzer = TrendAnalyzer::new(store, vec![target("connections", 500.0)]);
        let issues = analyzer.analyze("db-1", &empty_data()).await.unwrap();
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn falling_metric_never_fires() {
        let store = store_with_slope("connections", 400.0, -5.0);
        let analyzer = TrendAnalyzer::new(store, vec![target("connections", 100.0)]);
        let issues = analyzer.analyze("db-1", &empty_data()).await.unwrap();
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn flat_series_is_filtered_by_min_slope() {
        let store = store_with_slope("connections", 400.0, 0.0);
        let analyzer = TrendAnalyzer::new(store, vec![target("connections", 100.0)]);
        let issues = analyzer.analyze("db-1", &empty_data()).await.unwrap();
        assert!(issues.is_empty());
    }

    #[test]
    fn linear_fit_recovers_slope() {
        let t0 = Utc::now();
        let points: Vec<MetricPoint> = (0..10)
            .map(|i| MetricPoint {
                timestamp: t0 + ChronoDuration::seconds(i * 60),
                value: 10.0 + 0.5 * i as f64,
            })
            .collect();
        let (slope, intercept) = linear_fit(&points).unwrap();
        // 0.5 per minute = 1/120 per second.
        assert!((slope - 0.5 / 60.0).abs() < 1e-9);
        assert!((intercept - 10.0).abs() < 1e-6);
    }
}
