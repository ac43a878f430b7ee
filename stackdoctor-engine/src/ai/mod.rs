//! RAG-augmented AI analysis: prompt templating, structured output
//! parsing with validation and repair, multi-turn sessions, and few-shot
//! retrieval.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod analyzer;
pub mod fewshot;
pub mod parser;
pub mod prompt;
pub mod session;

pub use analyzer::{AiAnalyzer, AiAnalyzerBuilder, AiOutcome};
pub use fewshot::{FewShotExample, FewShotManager};
pub use parser::{AiAnalysis, RepairPlan, RepairStep};
pub use prompt::PromptLibrary;
pub use session::{ConversationSession, MultiTurnManager, Turn, TurnRole};

/// `[ai]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// OpenAI-compatible endpoint base URL.
    #[serde(default)]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Budget for injected knowledge, in tokens of the configured
    /// counter.
    #[serde(default = "default_knowledge_tokens")]
    pub knowledge_max_tokens: usize,
    /// Parsed confidence below this asks a clarification question.
    #[serde(default = "default_clarify_threshold")]
    pub clarify_threshold: f64,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(
        default = "default_session_ttl",
        with = "stackdoctor_sdk::common::duration_serde"
    )]
    pub session_ttl: Duration,
    /// Token counter choice: `approx` is the `len/4` heuristic. Swapping
    /// counters changes which documents fit the budget, so it is an
    /// explicit setting.
    #[serde(default = "default_token_counter")]
    pub token_counter: String,
    /// Whether HyDE query expansion runs before retrieval.
    #[serde(default = "default_true")]
    pub hyde_enabled: bool,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_knowledge_tokens() -> usize {
    2000
}

fn default_clarify_threshold() -> f64 {
    0.5
}

fn default_max_turns() -> usize {
    10
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_token_counter() -> String {
    "approx".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            knowledge_max_tokens: default_knowledge_tokens(),
            clarify_threshold: default_clarify_threshold(),
            max_turns: default_max_turns(),
            session_ttl: default_session_ttl(),
            token_counter: default_token_counter(),
            hyde_enabled: true,
        }
    }
}
