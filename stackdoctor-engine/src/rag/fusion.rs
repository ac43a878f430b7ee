//! Result-list fusion.
//!
//! RRF (reciprocal rank fusion) scores a document `Σ 1/(k + rank)` over
//! every list it appears in (rank is 1-based); weighted fusion scores
//! `Σ w_source · score`. Both dedupe by document id, keep the first-seen
//! payload, and sort by fused score descending with a stable tie-break on
//! first appearance.

use stackdoctor_sdk::models::RetrievalResult;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum FusionStrategy {
    Rrf { k: f64 },
    Weighted { weights: HashMap<String, f64> },
}

impl Default for FusionStrategy {
    fn default() -> Self {
        FusionStrategy::Rrf { k: 60.0 }
    }
}

fn source_key(result: &RetrievalResult) -> &'static str {
    match result.source {
        stackdoctor_sdk::models::RetrievalSource::Vector => "vector",
        stackdoctor_sdk::models::RetrievalSource::Keyword => "keyword",
        stackdoctor_sdk::models::RetrievalSource::Graph => "graph",
    }
}

/// Fuse per-source result lists into one ranked list.
pub fn fuse(lists: Vec<Vec<RetrievalResult>>, strategy: &FusionStrategy) -> Vec<RetrievalResult> {
    // doc_id -> (first-seen payload, fused score, first-seen order)
    let mut fused: HashMap<String, (RetrievalResult, f64, usize)> = HashMap::new();
    let mut order = 0usize;

    for list in lists {
        for (rank, result) in list.into_iter().enumerate() {
            let contribution = match strategy {
                FusionStrategy::Rrf { k } => 1.0 / (k + (rank as f64 + 1.0)),
                FusionStrategy::Weighted { weights } => {
                    let weight = weights.get(source_key(&result)).copied().unwrap_or(1.0);
                    weight * result.score
                }
            };
            match fused.get_mut(&result.doc_id) {
                Some((_, score, _)) => *score += contribution,
                None => {
                    let doc_id = result.doc_id.clone();
                    fused.insert(doc_id, (result, contribution, order));
                    order += 1;
                }
            }
        }
    }

    let mut merged: Vec<(RetrievalResult, f64, usize)> = fused.into_values().collect();
    merged.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));
    merged
        .into_iter()
        .map(|(mut result, score, _)| {
            result.score = score;
            result
        })
        .collect()
}

/// Dedupe by document id keeping the maximum score; the fallback variant
/// fusion when no strategy is configured.
pub fn dedup_max(lists: Vec<Vec<RetrievalResult>>) -> Vec<RetrievalResult> {
    let mut best: HashMap<String, (RetrievalResult, usize)> = HashMap::new();
    let mut order = 0usize;
    for list in lists {
        for result in list {
            match best.get_mut(&result.doc_id) {
                Some((existing, _)) => {
                    if result.score > existing.score {
                        *existing = result;
                    }
                }
                None => {
                    best.insert(result.doc_id.clone(), (result, order));
                    order += 1;
                }
            }
        }
    }
    let mut merged: Vec<(RetrievalResult, usize)> = best.into_values().collect();
    merged.sort_by(|a, b| b.0.score.total_cmp(&a.0.score).then(a.1.cmp(&b.1)));
    merged.into_iter().map(|(result, _)| result).collect()
}
