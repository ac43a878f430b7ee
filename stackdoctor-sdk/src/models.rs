//! # Shared Data Model
//!
//! Core types flowing through the diagnosis pipeline: collected metrics,
//! the immutable per-request [`DiagnosticData`] snapshot, rule and issue
//! types, the final [`DiagnosisResult`], and the retrieval types consumed
//! by the RAG subsystem.
//!
//! ## Severity
//!
//! [`Severity`] has a total order (`Info < Warning < Error < Critical`).
//! The canonical serialized form is lowercase; parsing accepts any casing
//! so AI output such as `"Critical"` or `"CRITICAL"` normalizes at the
//! boundary instead of leaking mixed casing through the system.
//!
//! ## Immutability
//!
//! [`MetricsSnapshot`] and [`DiagnosticData`] are built once per request
//! and never mutated afterwards: snapshots expose read accessors only and
//! are assembled through [`MetricsSnapshotBuilder`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A single scalar observation: 64-bit float for derived ratios, signed
/// 64-bit integer for counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricScalar {
    Int(i64),
    Float(f64),
}

impl MetricScalar {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricScalar::Int(v) => *v as f64,
            MetricScalar::Float(v) => *v,
        }
    }
}

impl From<f64> for MetricScalar {
    fn from(v: f64) -> Self {
        MetricScalar::Float(v)
    }
}

impl From<i64> for MetricScalar {
    fn from(v: i64) -> Self {
        MetricScalar::Int(v)
    }
}

impl fmt::Display for MetricScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricScalar::Int(v) => write!(f, "{v}"),
            MetricScalar::Float(v) => write!(f, "{v}"),
        }
    }
}

/// A named metric with value, unit, labels and an optional threshold the
/// collector already knows about (e.g. `maxmemory`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub value: MetricScalar,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl MetricValue {
    pub fn new(name: impl Into<String>, value: impl Into<MetricScalar>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            unit: String::new(),
            labels: BTreeMap::new(),
            timestamp: Utc::now(),
            threshold: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// An immutable collection of metrics taken at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    timestamp: DateTime<Utc>,
    metrics: HashMap<String, MetricValue>,
    #[serde(default)]
    raw_data: HashMap<String, serde_json::Value>,
}

impl MetricsSnapshot {
    pub fn builder() -> MetricsSnapshotBuilder {
        MetricsSnapshotBuilder::default()
    }

    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            metrics: HashMap::new(),
            raw_data: HashMap::new(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metrics(&self) -> &HashMap<String, MetricValue> {
        &self.metrics
    }

    pub fn raw_data(&self) -> &HashMap<String, serde_json::Value> {
        &self.raw_data
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).map(|m| m.value.as_f64())
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Accumulates metrics before freezing them into a [`MetricsSnapshot`].
#[derive(Debug, Default)]
pub struct MetricsSnapshotBuilder {
    metrics: HashMap<String, MetricValue>,
    raw_data: HashMap<String, serde_json::Value>,
}

impl MetricsSnapshotBuilder {
    pub fn metric(mut self, metric: MetricValue) -> Self {
        self.metrics.insert(metric.name.clone(), metric);
        self
    }

    pub fn push(&mut self, metric: MetricValue) {
        self.metrics.insert(metric.name.clone(), metric);
    }

    pub fn raw(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.raw_data.insert(key.into(), value);
        self
    }

    pub fn push_raw(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.raw_data.insert(key.into(), value);
    }

    pub fn build(self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            metrics: self.metrics,
            raw_data: self.raw_data,
        }
    }
}

/// One slow-query/slow-command record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// Execution time in microseconds.
    pub duration_us: u64,
    pub statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

/// One client connection as reported by the middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<u64>,
}

/// Replication topology summary. `None` on the diagnostic data means the
/// middleware does not replicate or the instance is not part of a
/// replication set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub role: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lag_seconds: Option<i64>,
    #[serde(default)]
    pub connected_replicas: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// The immutable aggregate one diagnosis request operates on. Built once
/// by `get_diagnostic_data`, then shared read-only between the rule engine
/// and every analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticData {
    pub metrics: MetricsSnapshot,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub slow_logs: Vec<SlowLogEntry>,
    #[serde(default)]
    pub connections: Vec<ConnectionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationStatus>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl DiagnosticData {
    pub fn new(metrics: MetricsSnapshot) -> Self {
        Self {
            metrics,
            config: HashMap::new(),
            slow_logs: Vec::new(),
            connections: Vec::new(),
            replication: None,
            extra: HashMap::new(),
        }
    }
}

/// Issue severity with a total order. `Info < Warning < Error < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    /// Health-score penalty for one issue of this severity.
    pub fn score_penalty(&self) -> u32 {
        match self {
            Severity::Critical => 30,
            Severity::Error => 20,
            Severity::Warning => 10,
            Severity::Info => 2,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" | "crit" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl Serialize for Severity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A typed observation produced by a rule or analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub rule_id: String,
    pub name: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub suggestion: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub evidence: BTreeMap<String, serde_json::Value>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
}

impl Issue {
    pub fn new(rule_id: impl Into<String>, name: impl Into<String>, severity: Severity) -> Self {
        Self {
            rule_id: rule_id.into(),
            name: name.into(),
            severity,
            description: String::new(),
            suggestion: String::new(),
            evidence: BTreeMap::new(),
            detected_at: Utc::now(),
            category: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = suggestion.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_evidence(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.evidence.insert(key.into(), value);
        self
    }
}

/// A declarative diagnosis rule: a pure predicate over [`DiagnosticData`]
/// plus templated message and suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisRule {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    /// Expression evaluated against the diagnostic environment.
    pub condition: String,
    /// Message template rendered against the extracted evidence.
    pub message: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Overall status derived from the issue list; reported even when the AI
/// phase failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosisStatus {
    Healthy,
    Warning,
    Critical,
}

impl DiagnosisStatus {
    pub fn from_issues(issues: &[Issue]) -> Self {
        match issues.iter().map(|i| i.severity).max() {
            Some(Severity::Critical) | Some(Severity::Error) => DiagnosisStatus::Critical,
            Some(Severity::Warning) => DiagnosisStatus::Warning,
            _ => DiagnosisStatus::Healthy,
        }
    }
}

/// Health score in `[0, 100]`: start at 100, subtract a per-severity
/// penalty per issue, clamp at zero. Equals 100 exactly when no issues.
pub fn health_score(issues: &[Issue]) -> u8 {
    let penalty: u32 = issues.iter().map(|i| i.severity.score_penalty()).sum();
    100u32.saturating_sub(penalty) as u8
}

/// Options accompanying a diagnosis request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnoseOptions {
    /// Run the RAG-augmented AI phase in addition to rules and analyzers.
    #[serde(default)]
    pub ai: bool,
    /// Free-form operator question forwarded to the AI analyzer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Per-request deadline.
    #[serde(
        default,
        with = "crate::common::opt_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Deployment environment label (kubernetes, baremetal, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// A diagnosis request entering the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisRequest {
    pub middleware_type: String,
    pub instance: String,
    #[serde(default)]
    pub options: DiagnoseOptions,
}

/// The structured outcome of one diagnosis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub request_id: String,
    pub middleware_type: String,
    pub instance_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// End-to-end duration in milliseconds.
    pub duration_ms: u64,
    /// Sorted by severity descending, stable on ties.
    pub issues: Vec<Issue>,
    pub summary: String,
    pub health_score: u8,
    pub status: DiagnosisStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_data: Option<DiagnosticData>,
}

/// Where a retrieval hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Vector,
    Keyword,
    Graph,
}

/// Graph enrichment attached to a retrieval result without changing its
/// rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphContext {
    pub impact_scope: Vec<String>,
    pub impact_level: String,
}

/// A document in the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub doc_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub chunk_index: usize,
}

/// One scored retrieval hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub doc_id: String,
    pub content: String,
    pub score: f64,
    pub source: RetrievalSource,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub chunk_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphContext>,
}

/// Adapter-level health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// An action forwarded to a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Dry-run commands must never mutate backend state.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(
        default,
        with = "crate::common::opt_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            dry_run: false,
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Result of a plugin command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub dry_run: bool,
}

/// A command a plugin is willing to run, with a coarse risk grade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 1 (read-only) to 5 (destructive).
    pub risk: u8,
}
