//! Rerankers applied in order between the coarse filter and the final
//! cut.
//!
//! The threshold reranker drops candidates below a score floor without
//! touching the order. The LLM reranker asks the model for a 0..1
//! relevance per candidate, clamps it into range and re-sorts; a
//! per-candidate failure keeps that candidate's prior score.

use crate::error::DiagnosisError;
use stackdoctor_sdk::context::CallContext;
use stackdoctor_sdk::llm::LlmAdapter;
use stackdoctor_sdk::models::RetrievalResult;
use std::sync::Arc;

#[async_trait::async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn rerank(
        &self,
        ctx: &CallContext,
        query: &str,
        candidates: Vec<RetrievalResult>,
    ) -> Result<Vec<RetrievalResult>, DiagnosisError>;
}

pub struct ThresholdReranker {
    min_score: f64,
}

impl ThresholdReranker {
    pub fn new(min_score: f64) -> Self {
        Self { min_score }
    }
}

#[async_trait::async_trait]
impl Reranker for ThresholdReranker {
    fn name(&self) -> &'static str {
        "threshold"
    }

    async fn rerank(
        &self,
        _ctx: &CallContext,
        _query: &str,
        mut candidates: Vec<RetrievalResult>,
    ) -> Result<Vec<RetrievalResult>, DiagnosisError> {
        candidates.retain(|c| c.score >= self.min_score);
        Ok(candidates)
    }
}

pub struct LlmReranker {
    llm: Arc<dyn LlmAdapter>,
}

impl LlmReranker {
    pub fn new(llm: Arc<dyn LlmAdapter>) -> Self {
        Self { llm }
    }

    fn relevance_prompt(query: &str, content: &str) -> String {
        format!(
            "Rate the relevance of the following document to the query on a \
             scale from 0.0 to 1.0. Answer with the number only.\n\n\
             Query: {query}\n\nDocument:\n{content}\n\nRelevance:"
        )
    }
}

/// Extract the first float in the model's reply and clamp it to 0..=1.
fn parse_relevance(raw: &str) -> Option<f64> {
    let token = raw
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find(|t| !t.is_empty() && t.chars().any(|c| c.is_ascii_digit()))?;
    token.parse::<f64>().ok().map(|v| v.clamp(0.0, 1.0))
}

#[async_trait::async_trait]
impl Reranker for LlmReranker {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn rerank(
        &self,
        ctx: &CallContext,
        query: &str,
        mut candidates: Vec<RetrievalResult>,
    ) -> Result<Vec<RetrievalResult>, DiagnosisError> {
        for candidate in &mut candidates {
            let prompt = Self::relevance_prompt(query, &candidate.content);
            match self.llm.generate(ctx, &prompt).await {
                Ok(reply) => match parse_relevance(&reply) {
                    Some(score) => candidate.score = score,
                    None => {
                        tracing::debug!(
                            doc = %candidate.doc_id,
                            reply = %reply,
                            "unparseable relevance; keeping prior score"
                        );
                    }
                },
                Err(err) => {
                    tracing::debug!(
                        doc = %candidate.doc_id,
                        error = %err,
                        "relevance call failed; keeping prior score"
                    );
                }
            }
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(candidates)
    }
}
