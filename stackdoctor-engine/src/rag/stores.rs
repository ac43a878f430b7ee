//! Knowledge-store interfaces and in-memory reference implementations.
//!
//! The vector and keyword stores are the recall sources of the retriever;
//! the indexer mutates the knowledge base (`update` is defined as
//! delete-then-add); the graph querier optionally enriches results with
//! impact context.

use crate::error::DiagnosisError;
use stackdoctor_sdk::context::CallContext;
use stackdoctor_sdk::models::{GraphContext, KnowledgeDocument, RetrievalResult, RetrievalSource};
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    async fn search(
        &self,
        ctx: &CallContext,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, DiagnosisError>;
}

#[async_trait::async_trait]
pub trait KeywordStore: Send + Sync {
    async fn search(
        &self,
        ctx: &CallContext,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, DiagnosisError>;
}

#[async_trait::async_trait]
pub trait Indexer: Send + Sync {
    async fn add(&self, doc: KnowledgeDocument) -> Result<(), DiagnosisError>;

    async fn delete(&self, doc_id: &str) -> Result<(), DiagnosisError>;

    /// Update is delete-then-add.
    async fn update(&self, doc: KnowledgeDocument) -> Result<(), DiagnosisError> {
        self.delete(&doc.doc_id).await?;
        self.add(doc).await
    }

    async fn batch_update(&self, docs: Vec<KnowledgeDocument>) -> Result<(), DiagnosisError> {
        for doc in docs {
            self.update(doc).await?;
        }
        Ok(())
    }
}

/// Optional graph adapter: resolves a named entity in the query to its
/// impact context.
#[async_trait::async_trait]
pub trait GraphQuerier: Send + Sync {
    async fn context_for(
        &self,
        ctx: &CallContext,
        query: &str,
    ) -> Result<Option<GraphContext>, DiagnosisError>;
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

/// Keyword store scoring by query-term overlap.
#[derive(Default)]
pub struct InMemoryKeywordStore {
    docs: RwLock<Vec<KnowledgeDocument>>,
}

impl InMemoryKeywordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeywordStore for InMemoryKeywordStore {
    async fn search(
        &self,
        _ctx: &CallContext,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, DiagnosisError> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let docs = self.docs.read().expect("keyword store lock poisoned");
        let mut scored: Vec<RetrievalResult> = docs
            .iter()
            .filter_map(|doc| {
                let doc_terms = tokenize(&doc.content);
                let hits = terms.iter().filter(|t| doc_terms.contains(t)).count();
                if hits == 0 {
                    return None;
                }
                Some(RetrievalResult {
                    doc_id: doc.doc_id.clone(),
                    content: doc.content.clone(),
                    score: hits as f64 / terms.len() as f64,
                    source: RetrievalSource::Keyword,
                    metadata: doc.metadata.clone(),
                    chunk_index: doc.chunk_index,
                    graph: None,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[async_trait::async_trait]
impl Indexer for InMemoryKeywordStore {
    async fn add(&self, doc: KnowledgeDocument) -> Result<(), DiagnosisError> {
        self.docs
            .write()
            .expect("keyword store lock poisoned")
            .push(doc);
        Ok(())
    }

    async fn delete(&self, doc_id: &str) -> Result<(), DiagnosisError> {
        self.docs
            .write()
            .expect("keyword store lock poisoned")
            .retain(|d| d.doc_id != doc_id);
        Ok(())
    }
}

const EMBEDDING_DIM: usize = 256;

/// Deterministic bag-of-words embedding: each token hashes into one of
/// [`EMBEDDING_DIM`] buckets. Good enough to rank related text without an
/// external embedder; deployments plug a real vector database in via the
/// [`VectorStore`] trait.
fn hash_embed(text: &str) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut embedding = vec![0.0f32; EMBEDDING_DIM];
    for token in tokenize(text) {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        embedding[(hasher.finish() % EMBEDDING_DIM as u64) as usize] += 1.0;
    }
    embedding
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    f64::from(dot / (norm_a * norm_b))
}

/// Vector store over the deterministic hash embedding.
#[derive(Default)]
pub struct InMemoryVectorStore {
    docs: RwLock<HashMap<String, (KnowledgeDocument, Vec<f32>)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn search(
        &self,
        _ctx: &CallContext,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, DiagnosisError> {
        let query_embedding = hash_embed(query);
        let docs = self.docs.read().expect("vector store lock poisoned");
        let mut scored: Vec<RetrievalResult> = docs
            .values()
            .filter_map(|(doc, embedding)| {
                let score = cosine(&query_embedding, embedding);
                if score <= 0.0 {
                    return None;
                }
                Some(RetrievalResult {
                    doc_id: doc.doc_id.clone(),
                    content: doc.content.clone(),
                    score,
                    source: RetrievalSource::Vector,
                    metadata: doc.metadata.clone(),
                    chunk_index: doc.chunk_index,
                    graph: None,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[async_trait::async_trait]
impl Indexer for InMemoryVectorStore {
    async fn add(&self, doc: KnowledgeDocument) -> Result<(), DiagnosisError> {
        let embedding = hash_embed(&doc.content);
        self.docs
            .write()
            .expect("vector store lock poisoned")
            .insert(doc.doc_id.clone(), (doc, embedding));
        Ok(())
    }

    async fn delete(&self, doc_id: &str) -> Result<(), DiagnosisError> {
        self.docs
            .write()
            .expect("vector store lock poisoned")
            .remove(doc_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, content: &str) -> KnowledgeDocument {
        KnowledgeDocument {
            doc_id: id.to_string(),
            content: content.to_string(),
            metadata: Default::default(),
            chunk_index: 0,
        }
    }

    #[tokio::test]
    async fn keyword_store_ranks_by_overlap() {
        let store = InMemoryKeywordStore::new();
        store
            .add(doc("a", "redis memory usage and eviction policy"))
            .await
            .unwrap();
        store.add(doc("b", "kafka consumer lag")).await.unwrap();

        let results = store
            .search(&CallContext::background(), "redis memory", 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, "a");
        assert_eq!(results[0].source, RetrievalSource::Keyword);
        assert!((results[0].score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_query_returns_empty() {
        let store = InMemoryKeywordStore::new();
        store.add(doc("a", "anything")).await.unwrap();
        let results = store
            .search(&CallContext::background(), "  ", 10)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn vector_store_prefers_related_text() {
        let store = InMemoryVectorStore::new();
        store
            .add(doc("mem", "redis memory usage high eviction"))
            .await
            .unwrap();
        store
            .add(doc("lag", "kafka partition consumer lag offsets"))
            .await
            .unwrap();

        let results = store
            .search(&CallContext::background(), "redis memory problems", 10)
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].doc_id, "mem");
        assert_eq!(results[0].source, RetrievalSource::Vector);
    }

    #[tokio::test]
    async fn update_is_delete_then_add() {
        let store = InMemoryKeywordStore::new();
        store.add(doc("a", "original text")).await.unwrap();
        store.update(doc("a", "replacement text")).await.unwrap();

        let results = store
            .search(&CallContext::background(), "replacement", 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        let stale = store
            .search(&CallContext::background(), "original", 10)
            .await
            .unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn cosine_properties() {
        let a = hash_embed("redis memory");
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(cosine(&a, &vec![0.0; EMBEDDING_DIM]), 0.0);
    }
}
