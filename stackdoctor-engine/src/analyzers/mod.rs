//! Statistical analyzers running alongside the rule engine.
//!
//! All three receive the same immutable [`DiagnosticData`] and emit
//! issues independently; the diagnosis engine runs them concurrently and
//! merges their output. An analyzer failure is recovered locally — it is
//! logged and its issues are simply absent from the result.

use crate::error::DiagnosisError;
use stackdoctor_sdk::models::{DiagnosticData, Issue};

pub mod anomaly;
pub mod threshold;
pub mod trend;

pub use anomaly::AnomalyAnalyzer;
pub use threshold::{MetricThreshold, ThresholdAnalyzer};
pub use trend::{TrendAnalyzer, TrendTarget};

#[async_trait::async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Analyze one instance's snapshot. `instance` keys history lookups
    /// for the statistical analyzers.
    async fn analyze(
        &self,
        instance: &str,
        data: &DiagnosticData,
    ) -> Result<Vec<Issue>, DiagnosisError>;
}
