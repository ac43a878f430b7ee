//! Few-shot example manager.
//!
//! Stores worked examples and retrieves the ones most similar to the
//! current query, filtered by category (case-insensitive; an empty
//! category matches everything). With an embedder available, similarity
//! is cosine over embeddings; without one, the first K examples after
//! filtering are returned in stable id order.

use crate::rag::stores::cosine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stackdoctor_sdk::context::CallContext;
use stackdoctor_sdk::llm::LlmAdapter;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotExample {
    pub id: String,
    pub category: String,
    /// The observed situation (metrics, symptoms).
    pub input: String,
    /// The reasoning a good analysis walked through.
    pub analysis: String,
    /// The structured output produced.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

pub struct FewShotManager {
    examples: DashMap<String, FewShotExample>,
    embedder: Option<Arc<dyn LlmAdapter>>,
}

impl FewShotManager {
    pub fn new(embedder: Option<Arc<dyn LlmAdapter>>) -> Self {
        Self {
            examples: DashMap::new(),
            embedder,
        }
    }

    pub fn add(&self, example: FewShotExample) {
        self.examples.insert(example.id.clone(), example);
    }

    pub fn remove(&self, id: &str) {
        self.examples.remove(id);
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub async fn retrieve_similar(
        &self,
        ctx: &CallContext,
        query: &str,
        category: &str,
        top_k: usize,
    ) -> Vec<FewShotExample> {
        let mut filtered: Vec<FewShotExample> = self
            .examples
            .iter()
            .filter(|entry| {
                category.is_empty() || entry.category.eq_ignore_ascii_case(category)
            })
            .map(|entry| entry.value().clone())
            .collect();
        // DashMap iteration order is arbitrary; make the fallback stable.
        filtered.sort_by(|a, b| a.id.cmp(&b.id));

        if let Some(embedder) = &self.embedder {
            if let Ok(query_embedding) = embedder.embed(ctx, query).await {
                let mut scored: Vec<(f64, FewShotExample)> = filtered
                    .into_iter()
                    .map(|example| {
                        let score = example
                            .embedding
                            .as_ref()
                            .map(|e| cosine(&query_embedding, e))
                            .unwrap_or(0.0);
                        (score, example)
                    })
                    .collect();
                scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                return scored
                    .into_iter()
                    .take(top_k)
                    .map(|(_, example)| example)
                    .collect();
            }
            tracing::debug!("query embedding failed; falling back to unranked examples");
        }

        filtered.truncate(top_k);
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(id: &str, category: &str, embedding: Option<Vec<f32>>) -> FewShotExample {
        FewShotExample {
            id: id.to_string(),
            category: category.to_string(),
            input: format!("input {id}"),
            analysis: format!("analysis {id}"),
            output: "{}".to_string(),
            embedding,
        }
    }

    #[tokio::test]
    async fn category_filter_is_case_insensitive() {
        let manager = FewShotManager::new(None);
        manager.add(example("a", "Memory", None));
        manager.add(example("b", "replication", None));

        let hits = manager
            .retrieve_similar(&CallContext::background(), "q", "MEMORY", 10)
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn empty_category_matches_all() {
        let manager = FewShotManager::new(None);
        manager.add(example("a", "memory", None));
        manager.add(example("b", "replication", None));

        let hits = manager
            .retrieve_similar(&CallContext::background(), "q", "", 10)
            .await;
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn missing_embedder_returns_first_k_in_stable_order() {
        let manager = FewShotManager::new(None);
        for id in ["c", "a", "b"] {
            manager.add(example(id, "memory", None));
        }
        let hits = manager
            .retrieve_similar(&CallContext::background(), "q", "memory", 2)
            .await;
        let ids: Vec<&str> = hits.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    struct UnitEmbedder;

    #[async_trait::async_trait]
    impl LlmAdapter for UnitEmbedder {
        async fn send_message(
            &self,
            _ctx: &CallContext,
            _request: stackdoctor_sdk::llm::ChatRequest,
        ) -> Result<stackdoctor_sdk::llm::ChatResponse, stackdoctor_sdk::PluginError> {
            Err(stackdoctor_sdk::PluginError::Unsupported {
                operation: "chat".into(),
            })
        }

        async fn embed(
            &self,
            _ctx: &CallContext,
            _text: &str,
        ) -> Result<Vec<f32>, stackdoctor_sdk::PluginError> {
            Ok(vec![1.0, 0.0])
        }

        async fn send_streaming_message(
            &self,
            _ctx: &CallContext,
            _request: stackdoctor_sdk::llm::ChatRequest,
        ) -> Result<stackdoctor_sdk::llm::StreamReceiver, stackdoctor_sdk::PluginError> {
            Err(stackdoctor_sdk::PluginError::Unsupported {
                operation: "stream".into(),
            })
        }
    }

    #[tokio::test]
    async fn embedder_ranks_by_cosine_similarity() {
        let manager = FewShotManager::new(Some(Arc::new(UnitEmbedder)));
        manager.add(example("aligned", "m", Some(vec![1.0, 0.0])));
        manager.add(example("orthogonal", "m", Some(vec![0.0, 1.0])));
        manager.add(example("unembedded", "m", None));

        let hits = manager
            .retrieve_similar(&CallContext::background(), "q", "m", 2)
            .await;
        assert_eq!(hits[0].id, "aligned");
        assert_ne!(hits[1].id, "unembedded" /* scores 0.0, ties last */);
    }
}
