//! Knowledge injection under a token budget.
//!
//! Retrieved documents are sorted by score descending and accumulated
//! into the prompt until adding the next would exceed `max_tokens`;
//! accumulation stops at the first overflow, so shrinking the budget can
//! only ever drop a suffix — it never lets a previously excluded document
//! in. Each included chunk gets a title line and separator.
//!
//! Token counting is a configured choice, not an implementation detail:
//! the default [`ApproxTokenCounter`] estimates `len/4`, and swapping in
//! a real tokenizer changes which documents fit, so the counter is an
//! explicit trait object.

use stackdoctor_sdk::models::RetrievalResult;
use std::sync::Arc;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    fn name(&self) -> &'static str;
}

/// `len/4` byte heuristic.
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.len() / 4
    }

    fn name(&self) -> &'static str {
        "approx"
    }
}

pub struct KnowledgeInjector {
    counter: Arc<dyn TokenCounter>,
    max_tokens: usize,
}

pub struct InjectedKnowledge {
    pub text: String,
    pub included: usize,
    pub tokens: usize,
}

impl KnowledgeInjector {
    pub fn new(counter: Arc<dyn TokenCounter>, max_tokens: usize) -> Self {
        Self {
            counter,
            max_tokens,
        }
    }

    fn render_chunk(index: usize, result: &RetrievalResult) -> String {
        format!(
            "### Reference {n}: {id}\n{content}\n---\n",
            n = index + 1,
            id = result.doc_id,
            content = result.content.trim()
        )
    }

    /// Build the knowledge-context block from scored results.
    pub fn inject(&self, results: &[RetrievalResult]) -> InjectedKnowledge {
        let mut sorted: Vec<&RetrievalResult> = results.iter().collect();
        sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut text = String::new();
        let mut tokens = 0usize;
        let mut included = 0usize;
        for result in sorted {
            let chunk = Self::render_chunk(included, result);
            let chunk_tokens = self.counter.count(&chunk);
            if tokens + chunk_tokens > self.max_tokens {
                break;
            }
            text.push_str(&chunk);
            tokens += chunk_tokens;
            included += 1;
        }
        InjectedKnowledge {
            text,
            included,
            tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackdoctor_sdk::models::RetrievalSource;

    fn hit(id: &str, score: f64, content: &str) -> RetrievalResult {
        RetrievalResult {
            doc_id: id.to_string(),
            content: content.to_string(),
            score,
            source: RetrievalSource::Vector,
            metadata: Default::default(),
            chunk_index: 0,
            graph: None,
        }
    }

    fn injector(max_tokens: usize) -> KnowledgeInjector {
        KnowledgeInjector::new(Arc::new(ApproxTokenCounter), max_tokens)
    }

    #[test]
    fn includes_by_score_descending() {
        let results = vec![
            hit("low", 0.1, "low priority content"),
            hit("high", 0.9, "high priority content"),
        ];
        let injected = injector(1_000).inject(&results);
        assert_eq!(injected.included, 2);
        let high_pos = injected.text.find("high priority").unwrap();
        let low_pos = injected.text.find("low priority").unwrap();
        assert!(high_pos < low_pos);
    }

    #[test]
    fn stops_at_the_first_overflow() {
        let big = "x".repeat(400); // ~100 tokens per chunk
        let results = vec![
            hit("a", 0.9, &big),
            hit("b", 0.8, &big),
            hit("c", 0.7, &big),
        ];
        let injected = injector(250).inject(&results);
        assert_eq!(injected.included, 2);
        assert!(injected.text.contains("a"));
        assert!(!injected.text.contains("### Reference 3"));
    }

    #[test]
    fn shrinking_the_budget_never_adds_documents() {
        let results: Vec<RetrievalResult> = (0..8)
            .map(|i| {
                hit(
                    &format!("doc{i}"),
                    1.0 - i as f64 / 10.0,
                    &"word ".repeat(50 + i * 10),
                )
            })
            .collect();

        let mut previous_ids: Option<Vec<String>> = None;
        for budget in [2_000usize, 1_000, 500, 250, 100, 10] {
            let injected = injector(budget).inject(&results);
            let ids: Vec<String> = (0..8)
                .map(|i| format!("doc{i}"))
                .filter(|id| injected.text.contains(&format!(": {id}\n")))
                .collect();
            if let Some(previous) = &previous_ids {
                for id in &ids {
                    assert!(
                        previous.contains(id),
                        "budget {budget} introduced {id} that a larger budget excluded"
                    );
                }
            }
            previous_ids = Some(ids);
        }
    }

    #[test]
    fn empty_results_inject_nothing() {
        let injected = injector(100).inject(&[]);
        assert_eq!(injected.included, 0);
        assert!(injected.text.is_empty());
    }

    #[test]
    fn chunks_carry_title_and_separator() {
        let injected = injector(1_000).inject(&[hit("runbook-12", 0.9, "flush the queue")]);
        assert!(injected.text.starts_with("### Reference 1: runbook-12\n"));
        assert!(injected.text.contains("\n---\n"));
    }
}
