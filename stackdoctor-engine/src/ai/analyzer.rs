//! # AI Analyzer
//!
//! The RAG-augmented analysis pipeline. Per query: rewrite → expand →
//! retrieve per variant → fuse variants → inject knowledge under the
//! token budget → render the prompt → call the LLM requesting a JSON
//! object → parse, repair and validate → on failure retry once with a
//! stricter suffix at temperature 0.1 → update the multi-turn session →
//! ask for clarification when confidence is low.
//!
//! The analyzer borrows its collaborators: the LLM adapter, retriever
//! and few-shot manager are injected `Arc` handles owned elsewhere.

use crate::ai::fewshot::FewShotManager;
use crate::ai::parser::{self, AiAnalysis};
use crate::ai::prompt::{
    ClarificationContext, DiagnosisPromptContext, PromptLibrary, CLARIFICATION_TEMPLATE,
    DIAGNOSIS_TEMPLATE, STRICT_SUFFIX,
};
use crate::ai::session::{MultiTurnManager, Turn, TurnRole};
use crate::ai::AiConfig;
use crate::error::DiagnosisError;
use crate::rag::fusion::{dedup_max, fuse, FusionStrategy};
use crate::rag::knowledge::{ApproxTokenCounter, KnowledgeInjector, TokenCounter};
use crate::rag::retriever::MultiStageRetriever;
use crate::rag::rewrite::{HydeExpander, QueryRewriter};
use stackdoctor_sdk::context::CallContext;
use stackdoctor_sdk::llm::{ChatMessage, ChatRequest, LlmAdapter};
use stackdoctor_sdk::models::{DiagnosticData, Issue, RetrievalResult};
use std::sync::Arc;

const FEW_SHOT_COUNT: usize = 2;
const MAX_METRIC_LINES: usize = 40;
const MAX_LOG_LINES: usize = 10;
const RETRY_TEMPERATURE: f32 = 0.1;

/// The outcome of one AI analysis pass.
#[derive(Debug, Clone)]
pub struct AiOutcome {
    pub analysis: AiAnalysis,
    pub needs_clarification: bool,
    pub clarification: Option<String>,
    pub knowledge_used: usize,
}

impl AiOutcome {
    /// Convert into an engine issue.
    pub fn to_issue(&self) -> Issue {
        let mut issue = Issue::new("ai-analysis", "AI Analysis", self.analysis.severity)
            .with_description(self.analysis.analysis.clone())
            .with_suggestion(self.analysis.suggestions.join("; "))
            .with_category(self.analysis.category.clone())
            .with_evidence(
                "confidence",
                serde_json::json!(self.analysis.confidence),
            );
        if !self.analysis.root_cause.is_empty() {
            issue = issue.with_evidence(
                "root_cause",
                serde_json::json!(self.analysis.root_cause),
            );
        }
        issue
    }
}

pub struct AiAnalyzer {
    llm: Arc<dyn LlmAdapter>,
    retriever: Arc<MultiStageRetriever>,
    fewshot: Arc<FewShotManager>,
    rewriter: QueryRewriter,
    expander: Option<HydeExpander>,
    injector: KnowledgeInjector,
    prompts: PromptLibrary,
    sessions: MultiTurnManager,
    /// Fusion across query variants; `None` falls back to dedup-by-max.
    variant_fusion: Option<FusionStrategy>,
    config: AiConfig,
}

pub struct AiAnalyzerBuilder {
    llm: Arc<dyn LlmAdapter>,
    retriever: Arc<MultiStageRetriever>,
    fewshot: Option<Arc<FewShotManager>>,
    counter: Option<Arc<dyn TokenCounter>>,
    variant_fusion: Option<FusionStrategy>,
    config: AiConfig,
}

impl AiAnalyzerBuilder {
    pub fn new(llm: Arc<dyn LlmAdapter>, retriever: Arc<MultiStageRetriever>) -> Self {
        Self {
            llm,
            retriever,
            fewshot: None,
            counter: None,
            variant_fusion: Some(FusionStrategy::default()),
            config: AiConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AiConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_fewshot(mut self, fewshot: Arc<FewShotManager>) -> Self {
        self.fewshot = Some(fewshot);
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Disable variant fusion, falling back to dedup-by-max-score.
    pub fn without_variant_fusion(mut self) -> Self {
        self.variant_fusion = None;
        self
    }

    pub fn build(self) -> AiAnalyzer {
        let counter = self
            .counter
            .unwrap_or_else(|| Arc::new(ApproxTokenCounter) as Arc<dyn TokenCounter>);
        let expander = if self.config.hyde_enabled {
            Some(HydeExpander::new(Arc::clone(&self.llm)))
        } else {
            None
        };
        AiAnalyzer {
            injector: KnowledgeInjector::new(counter, self.config.knowledge_max_tokens),
            expander,
            rewriter: QueryRewriter::with_default_dictionary(),
            prompts: PromptLibrary::new(),
            sessions: MultiTurnManager::new(self.config.max_turns, self.config.session_ttl),
            fewshot: self
                .fewshot
                .unwrap_or_else(|| Arc::new(FewShotManager::new(None))),
            llm: self.llm,
            retriever: self.retriever,
            variant_fusion: self.variant_fusion,
            config: self.config,
        }
    }
}

impl AiAnalyzer {
    pub fn sessions(&self) -> &MultiTurnManager {
        &self.sessions
    }

    /// Run the full pipeline for one operator query.
    pub async fn analyze(
        &self,
        ctx: &CallContext,
        session_id: &str,
        plugin_name: &str,
        query: &str,
        data: &DiagnosticData,
    ) -> Result<AiOutcome, DiagnosisError> {
        // 1-2: rewrite, then expand into query variants.
        let rewritten = self.rewriter.rewrite(query);
        let variants = match &self.expander {
            Some(expander) => expander.expand(ctx, &rewritten).await,
            None => vec![rewritten.clone()],
        };

        // 3: retrieve each variant.
        let mut variant_results: Vec<Vec<RetrievalResult>> = Vec::new();
        for variant in &variants {
            match self.retriever.retrieve(ctx, variant).await {
                Ok(results) => variant_results.push(results),
                Err(err) => {
                    tracing::warn!(error = %err, "variant retrieval failed; continuing");
                }
            }
        }

        // 4-5: fuse variants and cut to the final depth.
        let mut fused = match &self.variant_fusion {
            Some(strategy) => fuse(variant_results, strategy),
            None => dedup_max(variant_results),
        };
        fused.truncate(self.retriever.final_top_k());

        // 6: knowledge injection under the token budget.
        let knowledge = self.injector.inject(&fused);

        // 7: few-shot examples and the rendered prompt.
        let examples = self
            .fewshot
            .retrieve_similar(ctx, &rewritten, "", FEW_SHOT_COUNT)
            .await;
        let prompt = self.prompts.render(
            DIAGNOSIS_TEMPLATE,
            &DiagnosisPromptContext {
                plugin: plugin_name,
                timestamp: chrono::Utc::now().to_rfc3339(),
                query: &rewritten,
                metrics: metric_lines(data),
                logs: log_lines(data),
                knowledge: &knowledge.text,
                examples: &examples,
            },
        )?;

        // 8-10: call the model; retry once stricter on bad output.
        let history = self.sessions.history(session_id).await;
        self.sessions.append(session_id, Turn::user(query)).await;

        let (analysis, raw) = self.call_and_parse(ctx, &history, &prompt).await?;
        self.sessions
            .append(session_id, Turn::assistant(raw))
            .await;

        // 11: clarification on low confidence.
        let needs_clarification = analysis.confidence < self.config.clarify_threshold;
        let clarification = if needs_clarification {
            let question = PromptLibrary::clarification_question(&analysis.category);
            let text = self.prompts.render(
                CLARIFICATION_TEMPLATE,
                &ClarificationContext {
                    plugin: plugin_name,
                    confidence: analysis.confidence,
                    category: &analysis.category,
                    question,
                },
            )?;
            self.sessions
                .append(session_id, Turn::system(text.clone()))
                .await;
            Some(text)
        } else {
            None
        };

        Ok(AiOutcome {
            analysis,
            needs_clarification,
            clarification,
            knowledge_used: knowledge.included,
        })
    }

    async fn call_and_parse(
        &self,
        ctx: &CallContext,
        history: &[Turn],
        prompt: &str,
    ) -> Result<(AiAnalysis, String), DiagnosisError> {
        let first_reply = self
            .llm
            .send_message(ctx, self.chat_request(history, prompt, self.config.temperature))
            .await
            .map_err(DiagnosisError::from)?;

        match parser::parse_and_validate(&first_reply.message.content) {
            Ok(analysis) => Ok((analysis, first_reply.message.content)),
            Err(first_err) => {
                tracing::warn!(error = %first_err, "ai output rejected; retrying with strict prompt");
                let strict_prompt = format!("{prompt}{STRICT_SUFFIX}");
                let second_reply = self
                    .llm
                    .send_message(ctx, self.chat_request(history, &strict_prompt, RETRY_TEMPERATURE))
                    .await
                    .map_err(DiagnosisError::from)?;
                match parser::parse_and_validate(&second_reply.message.content) {
                    Ok(analysis) => Ok((analysis, second_reply.message.content)),
                    Err(second_err) => {
                        tracing::error!(error = %second_err, "ai output rejected twice");
                        Err(second_err)
                    }
                }
            }
        }
    }

    fn chat_request(&self, history: &[Turn], prompt: &str, temperature: f32) -> ChatRequest {
        let mut messages: Vec<ChatMessage> = history
            .iter()
            .map(|turn| match turn.role {
                TurnRole::User => ChatMessage::user(turn.content.clone()),
                TurnRole::Assistant => ChatMessage::assistant(turn.content.clone()),
                TurnRole::System => ChatMessage::system(turn.content.clone()),
            })
            .collect();
        messages.push(ChatMessage::user(prompt));
        ChatRequest::new(messages)
            .with_temperature(temperature)
            .with_max_tokens(self.config.max_tokens)
            .expecting_json()
    }
}

fn metric_lines(data: &DiagnosticData) -> String {
    let mut lines: Vec<String> = data
        .metrics
        .metrics()
        .iter()
        .map(|(name, metric)| format!("{name}={}", metric.value))
        .collect();
    lines.sort();
    lines.truncate(MAX_METRIC_LINES);
    lines.join("\n")
}

fn log_lines(data: &DiagnosticData) -> String {
    data.slow_logs
        .iter()
        .take(MAX_LOG_LINES)
        .map(|entry| format!("{} ({} us)", entry.statement, entry.duration_us))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::retriever::RetrieverBuilder;
    use crate::rag::stores::{InMemoryVectorStore, Indexer};
    use stackdoctor_sdk::error::PluginError;
    use stackdoctor_sdk::llm::{ChatResponse, StreamReceiver};
    use stackdoctor_sdk::models::{KnowledgeDocument, MetricValue, MetricsSnapshot, Severity};
    use std::sync::Mutex;

    const GOOD_REPLY: &str = "```json\n{\"category\": \"memory\", \"severity\": \"critical\", \
        \"confidence\": 0.9, \"root_cause\": \"maxmemory\", \"analysis\": \"Evicting.\", \
        \"suggestions\": [\"raise maxmemory\"]}\n```";

    const LOW_CONFIDENCE_REPLY: &str = "{\"category\": \"replication\", \"severity\": \"warning\", \
        \"confidence\": 0.2, \"root_cause\": \"\", \"analysis\": \"Unclear.\", \
        \"suggestions\": [\"check replicas\"]}";

    /// Returns scripted replies in order; records received prompts.
    struct SequencedLlm {
        replies: Mutex<Vec<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl SequencedLlm {
        fn new(replies: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmAdapter for SequencedLlm {
        async fn send_message(
            &self,
            _ctx: &CallContext,
            request: ChatRequest,
        ) -> Result<ChatResponse, PluginError> {
            self.prompts
                .lock()
                .unwrap()
                .push(request.messages.last().unwrap().content.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(PluginError::Timeout);
            }
            Ok(ChatResponse {
                message: ChatMessage::assistant(replies.remove(0)),
                usage: Default::default(),
                model: None,
            })
        }

        async fn embed(&self, _ctx: &CallContext, _text: &str) -> Result<Vec<f32>, PluginError> {
            Err(PluginError::Unsupported {
                operation: "embed".into(),
            })
        }

        async fn send_streaming_message(
            &self,
            _ctx: &CallContext,
            _request: ChatRequest,
        ) -> Result<StreamReceiver, PluginError> {
            Err(PluginError::Unsupported {
                operation: "stream".into(),
            })
        }
    }

    async fn retriever_with_docs() -> Arc<MultiStageRetriever> {
        let vector = Arc::new(InMemoryVectorStore::new());
        vector
            .add(KnowledgeDocument {
                doc_id: "runbook".to_string(),
                content: "redis memory eviction maxmemory runbook".to_string(),
                metadata: Default::default(),
                chunk_index: 0,
            })
            .await
            .unwrap();
        Arc::new(RetrieverBuilder::new(vector).build())
    }

    fn sample_data() -> DiagnosticData {
        DiagnosticData::new(
            MetricsSnapshot::builder()
                .metric(MetricValue::new("used_memory", 900_000_000i64))
                .metric(MetricValue::new("maxmemory", 1_000_000_000i64))
                .build(),
        )
    }

    fn analyzer_for(llm: Arc<SequencedLlm>, retriever: Arc<MultiStageRetriever>) -> AiAnalyzer {
        let config = AiConfig {
            enabled: true,
            hyde_enabled: false,
            ..Default::default()
        };
        AiAnalyzerBuilder::new(llm, retriever)
            .with_config(config)
            .build()
    }

    #[tokio::test]
    async fn fenced_lowercase_severity_parses_and_normalizes() {
        let llm = SequencedLlm::new(vec![GOOD_REPLY]);
        let analyzer = analyzer_for(Arc::clone(&llm), retriever_with_docs().await);

        let outcome = analyzer
            .analyze(
                &CallContext::background(),
                "s1",
                "redis",
                "why is memory full",
                &sample_data(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.analysis.severity, Severity::Critical);
        assert!(!outcome.needs_clarification);
        assert_eq!(outcome.knowledge_used, 1);
        // Knowledge and metrics made it into the prompt.
        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].contains("used_memory=900000000"));
        assert!(prompts[0].contains("runbook"));
    }

    #[tokio::test]
    async fn bad_output_triggers_one_strict_retry() {
        let llm = SequencedLlm::new(vec!["this is not json at all", GOOD_REPLY]);
        let analyzer = analyzer_for(Arc::clone(&llm), retriever_with_docs().await);

        let outcome = analyzer
            .analyze(
                &CallContext::background(),
                "s1",
                "redis",
                "memory?",
                &sample_data(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.analysis.category, "memory");
        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("ONLY a single JSON object"));
    }

    #[tokio::test]
    async fn twice_bad_output_surfaces_a_typed_error() {
        let llm = SequencedLlm::new(vec!["garbage", "more garbage"]);
        let analyzer = analyzer_for(llm, retriever_with_docs().await);

        let err = analyzer
            .analyze(
                &CallContext::background(),
                "s1",
                "redis",
                "memory?",
                &sample_data(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnosisError::Parse { .. }));
    }

    #[tokio::test]
    async fn low_confidence_asks_for_clarification() {
        let llm = SequencedLlm::new(vec![LOW_CONFIDENCE_REPLY]);
        let analyzer = analyzer_for(llm, retriever_with_docs().await);

        let outcome = analyzer
            .analyze(
                &CallContext::background(),
                "s1",
                "mysql",
                "replication broken?",
                &sample_data(),
            )
            .await
            .unwrap();

        assert!(outcome.needs_clarification);
        let clarification = outcome.clarification.unwrap();
        assert!(clarification.contains("failover"));

        // The session recorded user, assistant and the clarification.
        let history = analyzer.sessions().history("s1").await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, TurnRole::User);
        assert_eq!(history[2].role, TurnRole::System);
    }

    #[tokio::test]
    async fn llm_failure_aborts_the_ai_phase() {
        let llm = SequencedLlm::new(vec![]);
        let analyzer = analyzer_for(llm, retriever_with_docs().await);

        let err = analyzer
            .analyze(
                &CallContext::background(),
                "s1",
                "redis",
                "q",
                &sample_data(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnosisError::Plugin(_)));
    }

    #[tokio::test]
    async fn outcome_converts_to_a_severity_bearing_issue() {
        let llm = SequencedLlm::new(vec![GOOD_REPLY]);
        let analyzer = analyzer_for(llm, retriever_with_docs().await);

        let outcome = analyzer
            .analyze(
                &CallContext::background(),
                "s1",
                "redis",
                "q",
                &sample_data(),
            )
            .await
            .unwrap();
        let issue = outcome.to_issue();
        assert_eq!(issue.severity, Severity::Critical);
        assert_eq!(issue.category, "memory");
        assert_eq!(issue.evidence["confidence"], serde_json::json!(0.9));
    }
}
