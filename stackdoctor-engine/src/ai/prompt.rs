//! Prompt templates.
//!
//! Named handlebars templates rendered with typed substitutions. The
//! diagnosis template receives the plugin name, timestamp, operator
//! query, recent logs, metric lines, injected knowledge and optional
//! few-shot examples.

use crate::ai::fewshot::FewShotExample;
use crate::error::DiagnosisError;
use serde::Serialize;

pub const DIAGNOSIS_TEMPLATE: &str = "diagnosis";
pub const CLARIFICATION_TEMPLATE: &str = "clarification";

/// Appended on the retry after a parse or validation failure.
pub const STRICT_SUFFIX: &str = "\n\nIMPORTANT: Respond with ONLY a single JSON object, no markdown \
fences, no prose. Fields: category (string), severity (one of \
\"info\", \"warning\", \"error\", \"critical\"), confidence (number \
0..1), root_cause (string), analysis (string), suggestions (non-empty \
array of strings), optional repair_plan {steps: [{id, action, \
depends_on}]}.";

const DIAGNOSIS_SOURCE: &str = "You are a middleware diagnosis assistant analyzing a {{plugin}} \
instance at {{timestamp}}.\n\
{{#if query}}Operator question: {{query}}\n{{/if}}\
\n## Current metrics\n{{metrics}}\n\
{{#if logs}}\n## Recent slow operations\n{{logs}}\n{{/if}}\
{{#if knowledge}}\n## Reference knowledge\n{{knowledge}}\n{{/if}}\
{{#if examples}}\n## Worked examples\n{{#each examples}}\
### Example: {{this.category}}\nSituation: {{this.input}}\n\
Reasoning: {{this.analysis}}\nOutput: {{this.output}}\n{{/each}}{{/if}}\
\nDiagnose the instance. Respond with a JSON object with fields: \
category, severity (info|warning|error|critical), confidence (0..1), \
root_cause, analysis, suggestions (array), and optionally repair_plan \
{steps: [{id, action, depends_on}]}.";

const CLARIFICATION_SOURCE: &str = "The analysis of {{plugin}} came back with low confidence \
({{confidence}}) in category \"{{category}}\". {{question}}";

#[derive(Serialize)]
pub struct DiagnosisPromptContext<'a> {
    pub plugin: &'a str,
    pub timestamp: String,
    pub query: &'a str,
    pub metrics: String,
    pub logs: String,
    pub knowledge: &'a str,
    pub examples: &'a [FewShotExample],
}

#[derive(Serialize)]
pub struct ClarificationContext<'a> {
    pub plugin: &'a str,
    pub confidence: f64,
    pub category: &'a str,
    pub question: &'a str,
}

pub struct PromptLibrary {
    registry: handlebars::Handlebars<'static>,
}

impl PromptLibrary {
    pub fn new() -> Self {
        let mut registry = handlebars::Handlebars::new();
        registry.set_strict_mode(false);
        registry
            .register_template_string(DIAGNOSIS_TEMPLATE, DIAGNOSIS_SOURCE)
            .expect("builtin diagnosis template is valid");
        registry
            .register_template_string(CLARIFICATION_TEMPLATE, CLARIFICATION_SOURCE)
            .expect("builtin clarification template is valid");
        Self { registry }
    }

    /// Override or add a named template.
    pub fn register(&mut self, name: &str, source: &str) -> Result<(), DiagnosisError> {
        self.registry
            .register_template_string(name, source)
            .map_err(|e| DiagnosisError::config(e.to_string()))
    }

    pub fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String, DiagnosisError> {
        Ok(self.registry.render(name, context)?)
    }

    /// Category-specific clarification question.
    pub fn clarification_question(category: &str) -> &'static str {
        match category {
            "memory" => "Which workloads grew recently, and is eviction acceptable for this instance?",
            "performance" => "Did latency degrade gradually or suddenly, and at what time?",
            "connection" => "Which clients opened the new connections, and do they use pooling?",
            "replication" => "Was there a recent failover, network change or replica rebuild?",
            "configuration" => "Was any configuration changed recently, and by whom?",
            "availability" => "Are specific nodes unreachable, or is the whole cluster degraded?",
            "disk" => "Is disk growth driven by data, logs or snapshots?",
            _ => "Can you share more detail about when the problem started and what changed?",
        }
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}
