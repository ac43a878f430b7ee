//! # AI Output Parsing and Validation
//!
//! LLM replies arrive as free text that should contain a JSON object,
//! possibly wrapped in markdown code fences and prose. Parsing proceeds
//! in stages:
//!
//! 1. Strip code fences and extract the first balanced JSON object.
//! 2. Fuzzy-repair tolerable deviations in JSON space: severity casing
//!    normalizes to canonical lowercase, a numeric string confidence
//!    coerces to a number, and an unknown category falls back to
//!    `other`.
//! 3. Unmarshal into [`AiAnalysis`].
//! 4. Validate: required fields non-empty, confidence within 0..=1,
//!    suggestions non-empty, and for repair plans: unique step ids,
//!    every `depends_on` target exists, and the dependency graph is
//!    acyclic.
//!
//! Parse failures and validation failures are distinct error kinds so
//! the analyzer can retry with a stricter prompt before surfacing them.

use crate::error::DiagnosisError;
use serde::{Deserialize, Serialize};
use stackdoctor_sdk::models::Severity;
use std::collections::{HashMap, HashSet};

/// Categories the analyzer recognizes; anything else repairs to `other`.
pub const KNOWN_CATEGORIES: &[&str] = &[
    "memory",
    "performance",
    "connection",
    "replication",
    "configuration",
    "availability",
    "disk",
    "other",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiAnalysis {
    pub category: String,
    pub severity: Severity,
    pub confidence: f64,
    #[serde(default)]
    pub root_cause: String,
    pub analysis: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair_plan: Option<RepairPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairPlan {
    pub steps: Vec<RepairStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairStep {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<u8>,
}

/// Strip markdown fences and return the first balanced JSON object.
fn extract_json_block(raw: &str) -> Result<String, DiagnosisError> {
    // Prefer fenced content when present.
    let candidate = if let Some(start) = raw.find("```") {
        let after = &raw[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else {
        raw
    };

    let start = candidate
        .find('{')
        .ok_or_else(|| DiagnosisError::parse("no JSON object in response"))?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in candidate[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(candidate[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    Err(DiagnosisError::parse("unbalanced JSON object in response"))
}

/// Fuzzy repair in JSON space before the typed unmarshal.
fn repair(mut value: serde_json::Value) -> serde_json::Value {
    let Some(object) = value.as_object_mut() else {
        return value;
    };

    if let Some(severity) = object.get_mut("severity") {
        if let Some(s) = severity.as_str() {
            *severity = serde_json::json!(s.trim().to_ascii_lowercase());
        }
    }

    if let Some(confidence) = object.get_mut("confidence") {
        if let Some(s) = confidence.as_str() {
            if let Ok(parsed) = s.trim().parse::<f64>() {
                *confidence = serde_json::json!(parsed);
            }
        }
    }

    if let Some(category) = object.get_mut("category") {
        if let Some(s) = category.as_str() {
            let lowered = s.trim().to_ascii_lowercase();
            let repaired = if KNOWN_CATEGORIES.contains(&lowered.as_str()) {
                lowered
            } else {
                "other".to_string()
            };
            *category = serde_json::json!(repaired);
        }
    }

    value
}

/// Parse an LLM reply into a typed analysis (no validation yet).
pub fn parse_analysis(raw: &str) -> Result<AiAnalysis, DiagnosisError> {
    let block = extract_json_block(raw)?;
    let value: serde_json::Value = serde_json::from_str(&block)
        .map_err(|e| DiagnosisError::parse(format!("invalid JSON: {e}")))?;
    let repaired = repair(value);
    serde_json::from_value(repaired)
        .map_err(|e| DiagnosisError::parse(format!("unexpected shape: {e}")))
}

/// Schema validation over a parsed analysis.
pub fn validate_analysis(analysis: &AiAnalysis) -> Result<(), DiagnosisError> {
    if analysis.category.trim().is_empty() {
        return Err(DiagnosisError::validation("category must not be empty"));
    }
    if analysis.analysis.trim().is_empty() {
        return Err(DiagnosisError::validation("analysis must not be empty"));
    }
    if !(0.0..=1.0).contains(&analysis.confidence) {
        return Err(DiagnosisError::validation(format!(
            "confidence {} outside 0..=1",
            analysis.confidence
        )));
    }
    if analysis.suggestions.is_empty() {
        return Err(DiagnosisError::validation("suggestions must not be empty"));
    }
    if analysis.suggestions.iter().any(|s| s.trim().is_empty()) {
        return Err(DiagnosisError::validation("suggestions contain an empty entry"));
    }
    if let Some(plan) = &analysis.repair_plan {
        validate_repair_plan(plan)?;
    }
    Ok(())
}

fn validate_repair_plan(plan: &RepairPlan) -> Result<(), DiagnosisError> {
    if plan.steps.is_empty() {
        return Err(DiagnosisError::validation("repair plan has no steps"));
    }

    let mut ids = HashSet::new();
    for step in &plan.steps {
        if !ids.insert(step.id.as_str()) {
            return Err(DiagnosisError::validation(format!(
                "duplicate repair step id: {}",
                step.id
            )));
        }
        if let Some(risk) = step.risk {
            if !(1..=5).contains(&risk) {
                return Err(DiagnosisError::validation(format!(
                    "step {} risk {risk} outside 1..=5",
                    step.id
                )));
            }
        }
    }

    for step in &plan.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(DiagnosisError::validation(format!(
                    "step {} depends on unknown step {dep}",
                    step.id
                )));
            }
        }
    }

    // Cycle detection over the dependency graph.
    let edges: HashMap<&str, &Vec<String>> = plan
        .steps
        .iter()
        .map(|s| (s.id.as_str(), &s.depends_on))
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, &'a Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), DiagnosisError> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(DiagnosisError::validation(format!(
                    "repair plan has a dependency cycle through {node}"
                )))
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(deps) = edges.get(node) {
            for dep in deps.iter() {
                visit(dep.as_str(), edges, marks)?;
            }
        }
        marks.insert(node, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for step in &plan.steps {
        visit(step.id.as_str(), &edges, &mut marks)?;
    }
    Ok(())
}

/// Parse then validate; the single entry point used by the analyzer.
pub fn parse_and_validate(raw: &str) -> Result<AiAnalysis, DiagnosisError> {
    let analysis = parse_analysis(raw)?;
    validate_analysis(&analysis)?;
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json(severity: &str) -> String {
        format!(
            r#"{{
                "category": "memory",
                "severity": "{severity}",
                "confidence": 0.9,
                "root_cause": "maxmemory reached",
                "analysis": "The instance is evicting keys.",
                "suggestions": ["raise maxmemory"]
            }}"#
        )
    }

    #[test]
    fn parses_fenced_json_with_lowercase_severity() {
        let raw = format!("Here is my analysis:\n```json\n{}\n```\nHope it helps.", minimal_json("critical"));
        let analysis = parse_and_validate(&raw).unwrap();
        assert_eq!(analysis.severity, Severity::Critical);
        assert_eq!(analysis.category, "memory");
    }

    #[test]
    fn title_case_severity_is_repaired() {
        let analysis = parse_and_validate(&minimal_json("Critical")).unwrap();
        assert_eq!(analysis.severity, Severity::Critical);
        // Canonical form survives a serialize -> parse round trip.
        let serialized = serde_json::to_string(&analysis).unwrap();
        assert!(serialized.contains("\"severity\":\"critical\""));
        let reparsed = parse_and_validate(&serialized).unwrap();
        assert_eq!(reparsed, analysis);
    }

    #[test]
    fn unknown_category_repairs_to_other() {
        let raw = minimal_json("warning").replace("\"memory\"", "\"quantum flux\"");
        let analysis = parse_and_validate(&raw).unwrap();
        assert_eq!(analysis.category, "other");
    }

    #[test]
    fn string_confidence_is_coerced() {
        let raw = minimal_json("warning").replace("0.9", "\"0.75\"");
        let analysis = parse_and_validate(&raw).unwrap();
        assert!((analysis.confidence - 0.75).abs() < 1e-12);
    }

    #[test]
    fn prose_without_json_is_a_parse_error() {
        let err = parse_and_validate("I could not determine anything useful.").unwrap_err();
        assert!(matches!(err, DiagnosisError::Parse { .. }));
    }

    #[test]
    fn out_of_range_confidence_fails_validation() {
        let raw = minimal_json("warning").replace("0.9", "1.7");
        let err = parse_and_validate(&raw).unwrap_err();
        assert!(matches!(err, DiagnosisError::Validation { .. }));
    }

    #[test]
    fn empty_suggestions_fail_validation() {
        let raw = minimal_json("warning").replace("[\"raise maxmemory\"]", "[]");
        let err = parse_and_validate(&raw).unwrap_err();
        assert!(matches!(err, DiagnosisError::Validation { .. }));
    }

    fn with_plan(steps: &str) -> String {
        let mut base = minimal_json("warning");
        base.truncate(base.rfind('}').unwrap());
        format!("{base}, \"repair_plan\": {{\"steps\": {steps}}}}}")
    }

    #[test]
    fn valid_repair_plan_passes() {
        let raw = with_plan(
            r#"[
                {"id": "s1", "action": "snapshot", "depends_on": []},
                {"id": "s2", "action": "raise maxmemory", "depends_on": ["s1"]}
            ]"#,
        );
        let analysis = parse_and_validate(&raw).unwrap();
        assert_eq!(analysis.repair_plan.unwrap().steps.len(), 2);
    }

    #[test]
    fn duplicate_step_ids_fail() {
        let raw = with_plan(
            r#"[
                {"id": "s1", "action": "a"},
                {"id": "s1", "action": "b"}
            ]"#,
        );
        assert!(matches!(
            parse_and_validate(&raw),
            Err(DiagnosisError::Validation { .. })
        ));
    }

    #[test]
    fn unknown_dependency_fails() {
        let raw = with_plan(r#"[{"id": "s1", "action": "a", "depends_on": ["ghost"]}]"#);
        assert!(matches!(
            parse_and_validate(&raw),
            Err(DiagnosisError::Validation { .. })
        ));
    }

    #[test]
    fn dependency_cycles_fail() {
        let raw = with_plan(
            r#"[
                {"id": "s1", "action": "a", "depends_on": ["s2"]},
                {"id": "s2", "action": "b", "depends_on": ["s1"]}
            ]"#,
        );
        let err = parse_and_validate(&raw).unwrap_err();
        assert!(matches!(err, DiagnosisError::Validation { .. }));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn extracts_first_of_multiple_objects() {
        let raw = format!("{} and also {{\"noise\": true}}", minimal_json("info"));
        let analysis = parse_and_validate(&raw).unwrap();
        assert_eq!(analysis.severity, Severity::Info);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let raw = minimal_json("info").replace(
            "The instance is evicting keys.",
            "Watch for {braces} and \\\"quotes\\\" in prose.",
        );
        let analysis = parse_and_validate(&raw).unwrap();
        assert!(analysis.analysis.contains("{braces}"));
    }
}
