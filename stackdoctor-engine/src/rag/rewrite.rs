//! Query rewriting and expansion.
//!
//! The rewriter is deterministic: whitespace-tokenize, replace tokens
//! found in a case-insensitive typo dictionary, leave unknown tokens
//! untouched, preserve order. The HyDE expander asks the LLM for a short
//! hypothetical passage answering the query and retrieves on both; an
//! LLM failure degrades to the original query alone.

use stackdoctor_sdk::context::CallContext;
use stackdoctor_sdk::llm::LlmAdapter;
use std::collections::HashMap;
use std::sync::Arc;

pub struct QueryRewriter {
    /// Lowercased typo -> replacement.
    dictionary: HashMap<String, String>,
}

impl QueryRewriter {
    pub fn new(dictionary: HashMap<String, String>) -> Self {
        let dictionary = dictionary
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self { dictionary }
    }

    /// A dictionary covering the common middleware misspellings.
    pub fn with_default_dictionary() -> Self {
        let mut dictionary = HashMap::new();
        for (typo, fix) in [
            ("rediss", "redis"),
            ("reddis", "redis"),
            ("mysq", "mysql"),
            ("mysqll", "mysql"),
            ("kafak", "kafka"),
            ("kakfa", "kafka"),
            ("elastisearch", "elasticsearch"),
            ("elasticsearh", "elasticsearch"),
            ("postgress", "postgresql"),
            ("memroy", "memory"),
            ("conection", "connection"),
            ("replicaton", "replication"),
            ("latancy", "latency"),
        ] {
            dictionary.insert(typo.to_string(), fix.to_string());
        }
        Self::new(dictionary)
    }

    pub fn rewrite(&self, query: &str) -> String {
        query
            .split_whitespace()
            .map(|token| {
                self.dictionary
                    .get(&token.to_ascii_lowercase())
                    .map(String::as_str)
                    .unwrap_or(token)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub struct HydeExpander {
    llm: Arc<dyn LlmAdapter>,
}

impl HydeExpander {
    pub fn new(llm: Arc<dyn LlmAdapter>) -> Self {
        Self { llm }
    }

    /// Returns `[original, hypothetical]`, or `[original]` when the LLM
    /// call fails or produces nothing useful.
    pub async fn expand(&self, ctx: &CallContext, query: &str) -> Vec<String> {
        let prompt = format!(
            "Write a short technical passage (3-4 sentences) that would \
             appear in middleware operations documentation answering this \
             question. Output only the passage.\n\nQuestion: {query}"
        );
        match self.llm.generate(ctx, &prompt).await {
            Ok(passage) if !passage.trim().is_empty() => {
                vec![query.to_string(), passage.trim().to_string()]
            }
            Ok(_) => vec![query.to_string()],
            Err(err) => {
                tracing::debug!(error = %err, "hyde expansion failed; using original query");
                vec![query.to_string()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackdoctor_sdk::error::PluginError;
    use stackdoctor_sdk::llm::{ChatMessage, ChatRequest, ChatResponse, StreamReceiver};

    #[test]
    fn rewrites_known_typos_case_insensitively() {
        let rewriter = QueryRewriter::with_default_dictionary();
        assert_eq!(
            rewriter.rewrite("Reddis memroy usage spiking"),
            "redis memory usage spiking"
        );
    }

    #[test]
    fn unknown_tokens_and_order_survive() {
        let rewriter = QueryRewriter::with_default_dictionary();
        assert_eq!(
            rewriter.rewrite("why is MyInstance slow today"),
            "why is MyInstance slow today"
        );
        assert_eq!(rewriter.rewrite(""), "");
    }

    #[test]
    fn rewriting_is_deterministic() {
        let rewriter = QueryRewriter::with_default_dictionary();
        let query = "kafak conection errors";
        assert_eq!(rewriter.rewrite(query), rewriter.rewrite(query));
    }

    struct FixedLlm {
        reply: Result<String, ()>,
    }

    #[async_trait::async_trait]
    impl LlmAdapter for FixedLlm {
        async fn send_message(
            &self,
            _ctx: &CallContext,
            _request: ChatRequest,
        ) -> Result<ChatResponse, PluginError> {
            match &self.reply {
                Ok(text) => Ok(ChatResponse {
                    message: ChatMessage::assistant(text.clone()),
                    usage: Default::default(),
                    model: None,
                }),
                Err(()) => Err(PluginError::Timeout),
            }
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

    #[tokio::test]
    async fn expansion_returns_original_plus_passage() {
        let expander = HydeExpander::new(Arc::new(FixedLlm {
            reply: Ok("Redis evicts keys when maxmemory is reached.".to_string()),
        }));
        let variants = expander
            .expand(&CallContext::background(), "redis memory full")
            .await;
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0], "redis memory full");
        assert!(variants[1].contains("maxmemory"));
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_original() {
        let expander = HydeExpander::new(Arc::new(FixedLlm { reply: Err(()) }));
        let variants = expander
            .expand(&CallContext::background(), "redis memory full")
            .await;
        assert_eq!(variants, vec!["redis memory full".to_string()]);
    }
}
