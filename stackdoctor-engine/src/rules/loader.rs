//! JSON rule-file loader.
//!
//! File shape:
//!
//! ```json
//! {
//!   "name": "redis-extra-rules",
//!   "version": "1",
//!   "description": "Site-specific Redis rules",
//!   "rules": [
//!     {
//!       "id": "redis-ops-spike",
//!       "name": "Ops Spike",
//!       "severity": "warning",
//!       "condition": {"expression": "metrics.instantaneous_ops_per_sec > 50000"},
//!       "message": "Ops at {{metrics.instantaneous_ops_per_sec}}",
//!       "suggestion": "",
//!       "tags": ["load"],
//!       "enabled": true
//!     }
//!   ]
//! }
//! ```

use crate::error::DiagnosisError;
use crate::rules::expr;
use serde::{Deserialize, Serialize};
use stackdoctor_sdk::models::{DiagnosisRule, Severity};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFile {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub rules: Vec<RuleFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFileEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    pub condition: RuleCondition,
    pub message: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub expression: String,
}

fn default_enabled() -> bool {
    true
}

impl RuleFileEntry {
    pub fn to_rule(&self) -> DiagnosisRule {
        DiagnosisRule {
            id: self.id.clone(),
            name: self.name.clone(),
            severity: self.severity,
            condition: self.condition.expression.clone(),
            message: self.message.clone(),
            suggestion: self.suggestion.clone(),
            tags: self.tags.clone(),
            enabled: self.enabled,
        }
    }
}

/// Load and validate one rule file. Every condition must compile; rule
/// ids must be unique within the file.
pub fn load_rule_file(path: &Path) -> Result<Vec<DiagnosisRule>, DiagnosisError> {
    let raw = std::fs::read_to_string(path)?;
    parse_rule_file(&raw)
}

pub fn parse_rule_file(raw: &str) -> Result<Vec<DiagnosisRule>, DiagnosisError> {
    let file: RuleFile = serde_json::from_str(raw)?;
    if file.name.trim().is_empty() {
        return Err(DiagnosisError::config("rule file name must not be empty"));
    }

    let mut seen = HashSet::new();
    for entry in &file.rules {
        if entry.id.trim().is_empty() {
            return Err(DiagnosisError::config("rule id must not be empty"));
        }
        if !seen.insert(entry.id.clone()) {
            return Err(DiagnosisError::config(format!(
                "duplicate rule id: {}",
                entry.id
            )));
        }
        if entry.condition.expression.trim().is_empty() {
            return Err(DiagnosisError::config(format!(
                "rule {} has an empty condition",
                entry.id
            )));
        }
        expr::compile(&entry.condition.expression).map_err(|err| {
            DiagnosisError::config(format!(
                "rule {} condition does not compile: {err}",
                entry.id
            ))
        })?;
    }

    Ok(file.rules.iter().map(RuleFileEntry::to_rule).collect())
}
