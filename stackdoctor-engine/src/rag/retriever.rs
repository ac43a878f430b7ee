//! # Multi-Stage Retriever
//!
//! Pipeline: Recall → Fusion → Coarse filter → Rerank → Final cut.
//!
//! Recall runs vector search and (when enabled and configured) keyword
//! search in parallel with a per-source depth of `recall_top_k`; every
//! result is tagged with its source by the store that produced it. Fusion
//! merges the per-source lists (RRF or weighted). The coarse filter
//! truncates to `coarse_top_k` and drops fused scores below `min_score`.
//! Rerankers then run in their configured order, and the final cut
//! truncates to `final_top_k`.
//!
//! Zero candidates at any stage is not an error: the stages simply pass
//! the empty list through. Optional graph enrichment attaches impact
//! context to the results without changing their order.

use crate::error::DiagnosisError;
use crate::rag::fusion::{fuse, FusionStrategy};
use crate::rag::rerank::Reranker;
use crate::rag::stores::{GraphQuerier, KeywordStore, VectorStore};
use crate::rag::RagConfig;
use stackdoctor_sdk::context::CallContext;
use stackdoctor_sdk::models::RetrievalResult;
use std::sync::Arc;

pub struct MultiStageRetriever {
    vector: Arc<dyn VectorStore>,
    keyword: Option<Arc<dyn KeywordStore>>,
    rerankers: Vec<Arc<dyn Reranker>>,
    graph: Option<Arc<dyn GraphQuerier>>,
    strategy: FusionStrategy,
    recall_top_k: usize,
    coarse_top_k: usize,
    final_top_k: usize,
    min_score: f64,
}

pub struct RetrieverBuilder {
    vector: Arc<dyn VectorStore>,
    keyword: Option<Arc<dyn KeywordStore>>,
    rerankers: Vec<Arc<dyn Reranker>>,
    graph: Option<Arc<dyn GraphQuerier>>,
    config: RagConfig,
}

impl RetrieverBuilder {
    pub fn new(vector: Arc<dyn VectorStore>) -> Self {
        Self {
            vector,
            keyword: None,
            rerankers: Vec::new(),
            graph: None,
            config: RagConfig::default(),
        }
    }

    pub fn with_keyword(mut self, keyword: Arc<dyn KeywordStore>) -> Self {
        self.keyword = Some(keyword);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.rerankers.push(reranker);
        self
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphQuerier>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_config(mut self, config: RagConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> MultiStageRetriever {
        let strategy = self.config.fusion_strategy();
        MultiStageRetriever {
            vector: self.vector,
            keyword: if self.config.keyword_enabled {
                self.keyword
            } else {
                None
            },
            rerankers: self.rerankers,
            graph: self.graph,
            strategy,
            recall_top_k: self.config.recall_top_k,
            coarse_top_k: self.config.coarse_top_k,
            final_top_k: self.config.final_top_k,
            min_score: self.config.min_score,
        }
    }
}

impl MultiStageRetriever {
    pub fn final_top_k(&self) -> usize {
        self.final_top_k
    }

    pub async fn retrieve(
        &self,
        ctx: &CallContext,
        query: &str,
    ) -> Result<Vec<RetrievalResult>, DiagnosisError> {
        // Recall: vector and keyword in parallel.
        let lists = match &self.keyword {
            Some(keyword) => {
                let (vector_results, keyword_results) = tokio::join!(
                    self.vector.search(ctx, query, self.recall_top_k),
                    keyword.search(ctx, query, self.recall_top_k),
                );
                let mut lists = Vec::new();
                match vector_results {
                    Ok(results) => lists.push(results),
                    Err(err) => {
                        tracing::warn!(error = %err, "vector recall failed; continuing without it")
                    }
                }
                match keyword_results {
                    Ok(results) => lists.push(results),
                    Err(err) => {
                        tracing::warn!(error = %err, "keyword recall failed; continuing without it")
                    }
                }
                lists
            }
            None => match self.vector.search(ctx, query, self.recall_top_k).await {
                Ok(results) => vec![results],
                Err(err) => {
                    tracing::warn!(error = %err, "vector recall failed");
                    Vec::new()
                }
            },
        };

        // Fusion.
        let fused = fuse(lists, &self.strategy);

        // Coarse filter.
        let mut candidates: Vec<RetrievalResult> = fused
            .into_iter()
            .take(self.coarse_top_k)
            .filter(|r| r.score >= self.min_score)
            .collect();

        // Rerank stages in configured order.
        for reranker in &self.rerankers {
            if candidates.is_empty() {
                break;
            }
            candidates = reranker.rerank(ctx, query, candidates).await?;
        }

        // Final cut.
        candidates.truncate(self.final_top_k);

        // Graph enrichment: attach context, never reorder.
        if let Some(graph) = &self.graph {
            match graph.context_for(ctx, query).await {
                Ok(Some(context)) => {
                    for candidate in &mut candidates {
                        if candidate.graph.is_none() {
                            candidate.graph = Some(context.clone());
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(error = %err, "graph enrichment failed; results unenriched")
                }
            }
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::rerank::ThresholdReranker;
    use crate::rag::stores::{InMemoryKeywordStore, InMemoryVectorStore, Indexer};
    use stackdoctor_sdk::models::{GraphContext, KnowledgeDocument};

    fn doc(id: &str, content: &str) -> KnowledgeDocument {
        KnowledgeDocument {
            doc_id: id.to_string(),
            content: content.to_string(),
            metadata: Default::default(),
            chunk_index: 0,
        }
    }

    async fn seeded_stores() -> (Arc<InMemoryVectorStore>, Arc<InMemoryKeywordStore>) {
        let vector = Arc::new(InMemoryVectorStore::new());
        let keyword = Arc::new(InMemoryKeywordStore::new());
        for (id, content) in [
            ("mem-runbook", "redis memory usage high maxmemory eviction policy"),
            ("frag-runbook", "redis memory fragmentation defrag restart"),
            ("kafka-lag", "kafka consumer group lag partitions offsets"),
        ] {
            vector.add(doc(id, content)).await.unwrap();
            keyword.add(doc(id, content)).await.unwrap();
        }
        (vector, keyword)
    }

    #[tokio::test]
    async fn retrieves_relevant_documents_from_both_sources() {
        let (vector, keyword) = seeded_stores().await;
        let retriever = RetrieverBuilder::new(vector)
            .with_keyword(keyword)
            .build();

        let results = retriever
            .retrieve(&CallContext::background(), "redis memory usage high")
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].doc_id, "mem-runbook");
    }

    #[tokio::test]
    async fn final_top_k_truncates() {
        let (vector, keyword) = seeded_stores().await;
        let config = RagConfig {
            final_top_k: 1,
            ..Default::default()
        };
        let retriever = RetrieverBuilder::new(vector)
            .with_keyword(keyword)
            .with_config(config)
            .build();

        let results = retriever
            .retrieve(&CallContext::background(), "redis memory")
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn zero_candidates_is_not_an_error() {
        let vector = Arc::new(InMemoryVectorStore::new());
        let retriever = RetrieverBuilder::new(vector).build();
        let results = retriever
            .retrieve(&CallContext::background(), "anything at all")
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn reranker_floor_applies_after_fusion() {
        let (vector, keyword) = seeded_stores().await;
        let retriever = RetrieverBuilder::new(vector)
            .with_keyword(keyword)
            .with_reranker(Arc::new(ThresholdReranker::new(f64::MAX)))
            .build();

        let results = retriever
            .retrieve(&CallContext::background(), "redis memory")
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    struct StaticGraph;

    #[async_trait::async_trait]
    impl GraphQuerier for StaticGraph {
        async fn context_for(
            &self,
            _ctx: &CallContext,
            query: &str,
        ) -> Result<Option<GraphContext>, DiagnosisError> {
            if query.contains("redis") {
                Ok(Some(GraphContext {
                    impact_scope: vec!["session-service".to_string(), "checkout".to_string()],
                    impact_level: "high".to_string(),
                }))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn graph_enrichment_attaches_without_reordering() {
        let (vector, keyword) = seeded_stores().await;
        let plain = RetrieverBuilder::new(Arc::clone(&vector) as Arc<dyn VectorStore>)
            .with_keyword(Arc::clone(&keyword) as Arc<dyn KeywordStore>)
            .build();
        let enriched = RetrieverBuilder::new(vector)
            .with_keyword(keyword)
            .with_graph(Arc::new(StaticGraph))
            .build();

        let ctx = CallContext::background();
        let baseline = plain.retrieve(&ctx, "redis memory usage").await.unwrap();
        let with_graph = enriched.retrieve(&ctx, "redis memory usage").await.unwrap();

        let baseline_ids: Vec<&str> = baseline.iter().map(|r| r.doc_id.as_str()).collect();
        let enriched_ids: Vec<&str> = with_graph.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(baseline_ids, enriched_ids);
        assert!(with_graph.iter().all(|r| r.graph.is_some()));
        assert_eq!(
            with_graph[0].graph.as_ref().unwrap().impact_level,
            "high"
        );
    }
}
