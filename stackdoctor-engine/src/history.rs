//! Bounded in-memory history: metric samples for the anomaly and trend
//! analyzers, and the diagnosis result FIFO.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use stackdoctor_sdk::models::{DiagnosisResult, MetricsSnapshot};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// One retained metric observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Time-series access for the statistical analyzers.
pub trait MetricsHistoryStore: Send + Sync {
    /// Record every metric in the snapshot for this instance.
    fn record(&self, instance: &str, snapshot: &MetricsSnapshot);

    /// Points for one metric within `window` of now, oldest first.
    fn query(&self, instance: &str, metric: &str, window: Duration) -> Vec<MetricPoint>;

    /// Names of metrics with at least one retained point.
    fn metric_names(&self, instance: &str) -> Vec<String>;
}

/// In-memory store bounded by retention duration and points per metric.
pub struct InMemoryHistoryStore {
    retention: Duration,
    max_points: usize,
    series: Mutex<HashMap<String, HashMap<String, VecDeque<MetricPoint>>>>,
}

impl InMemoryHistoryStore {
    pub fn new(retention: Duration, max_points: usize) -> Self {
        Self {
            retention,
            max_points,
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Test/backfill hook: insert a point at an explicit timestamp.
    pub fn record_point(&self, instance: &str, metric: &str, point: MetricPoint) {
        let mut series = self.series.lock().expect("history lock poisoned");
        let points = series
            .entry(instance.to_string())
            .or_default()
            .entry(metric.to_string())
            .or_default();
        points.push_back(point);
        while points.len() > self.max_points {
            points.pop_front();
        }
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        // 24 h of samples at a 30 s collection cadence.
        Self::new(Duration::from_secs(24 * 3600), 2880)
    }
}

impl MetricsHistoryStore for InMemoryHistoryStore {
    fn record(&self, instance: &str, snapshot: &MetricsSnapshot) {
        let timestamp = snapshot.timestamp();
        for (name, metric) in snapshot.metrics() {
            self.record_point(
                instance,
                name,
                MetricPoint {
                    timestamp,
                    value: metric.value.as_f64(),
                },
            );
        }
    }

    fn query(&self, instance: &str, metric: &str, window: Duration) -> Vec<MetricPoint> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(window.min(self.retention))
                .unwrap_or_else(|_| ChronoDuration::hours(24));
        let series = self.series.lock().expect("history lock poisoned");
        series
            .get(instance)
            .and_then(|metrics| metrics.get(metric))
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.timestamp >= cutoff)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn metric_names(&self, instance: &str) -> Vec<String> {
        let series = self.series.lock().expect("history lock poisoned");
        series
            .get(instance)
            .map(|metrics| metrics.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// FIFO of the most recent diagnosis results.
pub struct DiagnosisHistory {
    capacity: usize,
    results: Mutex<VecDeque<DiagnosisResult>>,
}

impl DiagnosisHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            results: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, result: DiagnosisResult) {
        let mut results = self.results.lock().expect("history lock poisoned");
        results.push_back(result);
        while results.len() > self.capacity {
            results.pop_front();
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<DiagnosisResult> {
        let results = self.results.lock().expect("history lock poisoned");
        results.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.results.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DiagnosisHistory {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackdoctor_sdk::models::{DiagnosisStatus, MetricValue};

    #[test]
    fn record_and_query_round_trip() {
        let store = InMemoryHistoryStore::default();
        let snapshot = MetricsSnapshot::builder()
            .metric(MetricValue::new("used_memory", 100i64))
            .build();
        store.record("redis-1", &snapshot);

        let points = store.query("redis-1", "used_memory", Duration::from_secs(3600));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 100.0);
        assert_eq!(store.metric_names("redis-1"), vec!["used_memory"]);
    }

    #[test]
    fn query_honors_the_window() {
        let store = InMemoryHistoryStore::default();
        store.record_point(
            "redis-1",
            "m",
            MetricPoint {
                timestamp: Utc::now() - ChronoDuration::hours(30),
                value: 1.0,
            },
        );
        store.record_point(
            "redis-1",
            "m",
            MetricPoint {
                timestamp: Utc::now(),
                value: 2.0,
            },
        );

        let points = store.query("redis-1", "m", Duration::from_secs(24 * 3600));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 2.0);
    }

    #[test]
    fn per_metric_point_cap_applies() {
        let store = InMemoryHistoryStore::new(Duration::from_secs(3600), 5);
        for i in 0..10 {
            store.record_point(
                "redis-1",
                "m",
                MetricPoint {
                    timestamp: Utc::now(),
                    value: f64::from(i),
                },
            );
        }
        let points = store.query("redis-1", "m", Duration::from_secs(3600));
        assert_eq!(points.len(), 5);
        assert_eq!(points[0].value, 5.0);
    }

    fn dummy_result(id: &str) -> DiagnosisResult {
        DiagnosisResult {
            request_id: id.to_string(),
            middleware_type: "redis".to_string(),
            instance_id: "redis-1".to_string(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration_ms: 1,
            issues: vec![],
            summary: String::new(),
            health_score: 100,
            status: DiagnosisStatus::Healthy,
            diagnostic_data: None,
        }
    }

    #[test]
    fn diagnosis_history_is_a_bounded_fifo() {
        let history = DiagnosisHistory::new(3);
        for i in 0..5 {
            history.push(dummy_result(&format!("r{i}")));
        }
        assert_eq!(history.len(), 3);
        let recent = history.recent(10);
        // Newest first; the two oldest were evicted.
        assert_eq!(recent[0].request_id, "r4");
        assert_eq!(recent[2].request_id, "r2");
    }
}
