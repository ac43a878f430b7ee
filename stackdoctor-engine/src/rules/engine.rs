//! # Rule Engine
//!
//! Compiles rule conditions (cached per rule id + source hash in an LRU),
//! evaluates them against an environment derived from [`DiagnosticData`],
//! extracts evidence for fired rules, and renders the message and
//! suggestion templates.
//!
//! Failure policy: a rule that fails to compile or evaluate, or whose
//! condition yields a non-boolean, is logged and skipped. A failing rule
//! never aborts the diagnosis.

use crate::rules::expr::{self, Expr};
use lru::LruCache;
use regex::Regex;
use serde_json::json;
use stackdoctor_sdk::models::{DiagnosisRule, DiagnosticData, Issue};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

const COMPILE_CACHE_SIZE: usize = 512;

pub struct RuleEngine {
    cache: Mutex<LruCache<String, Arc<Expr>>>,
    templates: handlebars::Handlebars<'static>,
    metric_ref: Regex,
}

impl RuleEngine {
    pub fn new() -> Self {
        let mut templates = handlebars::Handlebars::new();
        // Missing template variables render as empty rather than failing
        // the whole message.
        templates.set_strict_mode(false);
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(COMPILE_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            templates,
            metric_ref: Regex::new(r"metrics\.([A-Za-z_][A-Za-z0-9_]*)")
                .expect("metric reference regex is valid"),
        }
    }

    /// Evaluate every enabled rule against the data. Issues are returned
    /// in rule order; sorting happens in the diagnosis engine.
    pub fn evaluate(&self, rules: &[DiagnosisRule], data: &DiagnosticData) -> Vec<Issue> {
        let env = build_env(data);
        let mut issues = Vec::new();
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            match self.evaluate_rule(rule, data, &env) {
                Ok(Some(issue)) => issues.push(issue),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(rule = %rule.id, error = %err, "rule evaluation failed; skipping");
                }
            }
        }
        issues
    }

    fn evaluate_rule(
        &self,
        rule: &DiagnosisRule,
        data: &DiagnosticData,
        env: &expr::Value,
    ) -> Result<Option<Issue>, expr::ExprError> {
        let compiled = self.compile_cached(&rule.id, &rule.condition)?;
        if !expr::evaluate_bool(&compiled, env)? {
            return Ok(None);
        }

        let evidence = self.extract_evidence(&rule.condition, data);
        let context = render_context(&evidence, data);
        let description = self.render_or_raw(&rule.message, &context);
        let suggestion = self.render_or_raw(&rule.suggestion, &context);

        let mut issue = Issue::new(&rule.id, &rule.name, rule.severity)
            .with_description(description)
            .with_suggestion(suggestion)
            .with_category(rule.tags.first().cloned().unwrap_or_default());
        for (key, value) in evidence {
            issue = issue.with_evidence(key, value);
        }
        Ok(Some(issue))
    }

    fn compile_cached(&self, rule_id: &str, source: &str) -> Result<Arc<Expr>, expr::ExprError> {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        let key = format!("{rule_id}:{:x}", hasher.finish());

        let mut cache = self.cache.lock().expect("compile cache lock poisoned");
        if let Some(expr) = cache.get(&key) {
            return Ok(Arc::clone(expr));
        }
        let compiled = Arc::new(expr::compile(source)?);
        cache.put(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Capture the concrete value of every `metrics.<name>` the condition
    /// references and the data actually holds.
    fn extract_evidence(
        &self,
        condition: &str,
        data: &DiagnosticData,
    ) -> Vec<(String, serde_json::Value)> {
        let mut evidence = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for capture in self.metric_ref.captures_iter(condition) {
            let name = capture[1].to_string();
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(metric) = data.metrics.get(&name) {
                if let Ok(value) = serde_json::to_value(metric.value) {
                    evidence.push((name, value));
                }
            }
        }
        evidence
    }

    fn render_or_raw(&self, template: &str, context: &serde_json::Value) -> String {
        if template.is_empty() {
            return String::new();
        }
        match self.templates.render_template(template, context) {
            Ok(rendered) => rendered,
            Err(err) => {
                tracing::debug!(error = %err, "template render failed; using raw template");
                template.to_string()
            }
        }
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// The evaluation environment: metrics flattened to numbers plus the
/// structured collections.
pub fn build_env(data: &DiagnosticData) -> expr::Value {
    let metrics: serde_json::Map<String, serde_json::Value> = data
        .metrics
        .metrics()
        .iter()
        .map(|(name, metric)| (name.clone(), json!(metric.value.as_f64())))
        .collect();

    let env = json!({
        "metrics": metrics,
        "config": data.config,
        "slowlogs": data.slow_logs,
        "connections": data.connections,
        "replication": data.replication,
        "extra": data.extra,
    });
    expr::Value::from(&env)
}

fn render_context(
    evidence: &[(String, serde_json::Value)],
    data: &DiagnosticData,
) -> serde_json::Value {
    let metrics: serde_json::Map<String, serde_json::Value> =
        evidence.iter().cloned().collect();
    json!({
        "metrics": metrics,
        "replication": data.replication,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackdoctor_sdk::models::{
        MetricValue, MetricsSnapshot, ReplicationStatus, Severity, SlowLogEntry,
    };

    fn data_with_metrics(metrics: &[(&str, f64)]) -> DiagnosticData {
        let mut builder = MetricsSnapshot::builder();
        for (name, value) in metrics {
            builder.push(MetricValue::new(*name, *value));
        }
        DiagnosticData::new(builder.build())
    }

    fn rule(id: &str, condition: &str, severity: Severity) -> DiagnosisRule {
        DiagnosisRule {
            id: id.to_string(),
            name: id.to_string(),
            severity,
            condition: condition.to_string(),
            message: "fired".to_string(),
            suggestion: String::new(),
            tags: vec!["test".to_string()],
            enabled: true,
        }
    }

    #[test]
    fn fires_and_captures_evidence() {
        let engine = RuleEngine::new();
        let data = data_with_metrics(&[("used_memory", 900_000_000.0), ("maxmemory", 1_000_000_000.0)]);
        let rules = vec![rule(
            "redis-memory-high",
            "metrics.used_memory / metrics.maxmemory > 0.8",
            Severity::Warning,
        )];

        let issues = engine.evaluate(&rules, &data);
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert_eq!(issue.severity, Severity::Warning);
        // Every evidence key appears in the condition and carries the
        // concrete collected value.
        assert_eq!(issue.evidence["used_memory"], json!(900_000_000.0));
        assert_eq!(issue.evidence["maxmemory"], json!(1_000_000_000.0));
    }

    #[test]
    fn non_firing_rule_produces_no_issue() {
        let engine = RuleEngine::new();
        let data = data_with_metrics(&[("used_memory", 1.0), ("maxmemory", 1_000.0)]);
        let rules = vec![rule(
            "redis-memory-high",
            "metrics.used_memory / metrics.maxmemory > 0.8",
            Severity::Warning,
        )];
        assert!(engine.evaluate(&rules, &data).is_empty());
    }

    #[test]
    fn failing_rule_is_skipped_not_fatal() {
        let engine = RuleEngine::new();
        let data = data_with_metrics(&[("present", 1.0)]);
        let rules = vec![
            rule("broken", "metrics.absent > 1", Severity::Warning),
            rule("not-bool", "1 + 1", Severity::Warning),
            rule("working", "metrics.present == 1", Severity::Info),
        ];

        let issues = engine.evaluate(&rules, &data);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule_id, "working");
    }

    #[test]
    fn disabled_rules_are_ignored() {
        let engine = RuleEngine::new();
        let data = data_with_metrics(&[("x", 1.0)]);
        let mut disabled = rule("off", "metrics.x == 1", Severity::Warning);
        disabled.enabled = false;
        assert!(engine.evaluate(&[disabled], &data).is_empty());
    }

    #[test]
    fn templates_render_against_evidence() {
        let engine = RuleEngine::new();
        let data = data_with_metrics(&[("hit_rate", 0.5)]);
        let mut r = rule("hr", "metrics.hit_rate < 0.8", Severity::Warning);
        r.message = "hit rate is {{metrics.hit_rate}}".to_string();
        let issues = engine.evaluate(&[r], &data);
        assert_eq!(issues[0].description, "hit rate is 0.5");
    }

    #[test]
    fn bad_template_falls_back_to_raw() {
        let engine = RuleEngine::new();
        let data = data_with_metrics(&[("x", 1.0)]);
        let mut r = rule("t", "metrics.x == 1", Severity::Info);
        r.message = "broken {{#if}} template".to_string();
        let issues = engine.evaluate(&[r], &data);
        assert_eq!(issues[0].description, "broken {{#if}} template");
    }

    #[test]
    fn slowlog_predicates_see_the_entries() {
        let engine = RuleEngine::new();
        let mut data = data_with_metrics(&[]);
        data.slow_logs.push(SlowLogEntry {
            id: 1,
            timestamp: chrono::Utc::now(),
            duration_us: 2_000_000,
            statement: "KEYS *".to_string(),
            client: None,
        });
        let rules = vec![rule(
            "slow",
            "any(slowlogs, |e| e.duration_us > 1000000)",
            Severity::Warning,
        )];
        assert_eq!(engine.evaluate(&rules, &data).len(), 1);
    }

    #[test]
    fn empty_slowlog_fires_nothing() {
        let engine = RuleEngine::new();
        let data = data_with_metrics(&[]);
        let rules = vec![rule("slow", "len(slowlogs) > 0", Severity::Warning)];
        assert!(engine.evaluate(&rules, &data).is_empty());
    }

    #[test]
    fn replication_fields_are_visible() {
        let engine = RuleEngine::new();
        let mut data = data_with_metrics(&[]);
        data.replication = Some(ReplicationStatus {
            role: "slave".to_string(),
            healthy: false,
            io_running: Some(false),
            sql_running: Some(true),
            lag_seconds: Some(120),
            connected_replicas: 0,
            detail: "IO thread stopped".to_string(),
        });
        let mut r = rule(
            "repl",
            "replication.role == \"slave\" && !replication.healthy",
            Severity::Critical,
        );
        r.message = "replication broken: {{replication.detail}}".to_string();

        let issues = engine.evaluate(&[r], &data);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].description, "replication broken: IO thread stopped");
    }
}
