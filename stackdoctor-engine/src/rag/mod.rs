//! Retrieval-augmented generation subsystem.
//!
//! The multi-stage retriever pipeline is Recall → Fusion → Coarse filter
//! → Rerank → Final cut, with optional graph enrichment at the end.
//! Knowledge stores and the graph querier are injected traits; in-memory
//! reference implementations back the tests and small deployments.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod fusion;
pub mod knowledge;
pub mod rerank;
pub mod retriever;
pub mod rewrite;
pub mod stores;

pub use fusion::{dedup_max, fuse, FusionStrategy};
pub use knowledge::{ApproxTokenCounter, KnowledgeInjector, TokenCounter};
pub use rerank::{LlmReranker, Reranker, ThresholdReranker};
pub use retriever::{MultiStageRetriever, RetrieverBuilder};
pub use rewrite::{HydeExpander, QueryRewriter};
pub use stores::{
    GraphQuerier, InMemoryKeywordStore, InMemoryVectorStore, Indexer, KeywordStore, VectorStore,
};

/// Retrieval pipeline tuning, loaded from the `[rag]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Per-source recall depth.
    #[serde(default = "default_recall_top_k")]
    pub recall_top_k: usize,
    /// Candidates surviving the coarse filter.
    #[serde(default = "default_coarse_top_k")]
    pub coarse_top_k: usize,
    /// Final result count.
    #[serde(default = "default_final_top_k")]
    pub final_top_k: usize,
    /// Fused scores below this are dropped at the coarse stage.
    #[serde(default)]
    pub min_score: f64,
    /// `rrf` or `weighted`.
    #[serde(default = "default_fusion")]
    pub fusion: String,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Per-source weights for weighted fusion (`vector`, `keyword`).
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    /// Whether keyword recall runs alongside vector recall.
    #[serde(default = "default_true")]
    pub keyword_enabled: bool,
    /// Score floor applied by the threshold reranker.
    #[serde(default)]
    pub rerank_min_score: f64,
}

fn default_recall_top_k() -> usize {
    100
}

fn default_coarse_top_k() -> usize {
    50
}

fn default_final_top_k() -> usize {
    10
}

fn default_fusion() -> String {
    "rrf".to_string()
}

fn default_rrf_k() -> f64 {
    60.0
}

fn default_true() -> bool {
    true
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            recall_top_k: default_recall_top_k(),
            coarse_top_k: default_coarse_top_k(),
            final_top_k: default_final_top_k(),
            min_score: 0.0,
            fusion: default_fusion(),
            rrf_k: default_rrf_k(),
            weights: HashMap::new(),
            keyword_enabled: true,
            rerank_min_score: 0.0,
        }
    }
}

impl RagConfig {
    pub fn fusion_strategy(&self) -> FusionStrategy {
        match self.fusion.as_str() {
            "weighted" => FusionStrategy::Weighted {
                weights: self.weights.clone(),
            },
            _ => FusionStrategy::Rrf { k: self.rrf_k },
        }
    }
}
