//! # LLM Adapter Abstraction
//!
//! The AI analyzer talks to language models exclusively through
//! [`LlmAdapter`]: chat completion, one-shot generation, embeddings and a
//! streaming variant. The adapter is injected and borrowed (`Arc`); the
//! analyzer never constructs or owns one.
//!
//! Streaming follows a producer/consumer shape: the adapter spawns a
//! producer task that feeds chunks into a bounded channel, and the caller
//! polls the receiver with cancellation. A slow consumer backpressures the
//! producer instead of buffering unboundedly.

use crate::context::CallContext;
use crate::error::PluginError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod http;

pub use http::{HttpLlmAdapter, HttpLlmConfig};

/// Capacity of the streaming chunk buffer.
pub const STREAM_BUFFER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Requested output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
            response_format: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn expecting_json(mut self) -> Self {
        self.response_format = Some(ResponseFormat::JsonObject);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One streamed delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub done: bool,
}

pub type StreamReceiver = mpsc::Receiver<Result<StreamChunk, PluginError>>;

/// The interface to a language model.
#[async_trait::async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Full chat completion.
    async fn send_message(
        &self,
        ctx: &CallContext,
        request: ChatRequest,
    ) -> Result<ChatResponse, PluginError>;

    /// One-shot text generation from a bare prompt.
    async fn generate(&self, ctx: &CallContext, prompt: &str) -> Result<String, PluginError> {
        let response = self
            .send_message(ctx, ChatRequest::new(vec![ChatMessage::user(prompt)]))
            .await?;
        Ok(response.message.content)
    }

    /// Embed a text into a vector.
    async fn embed(&self, ctx: &CallContext, text: &str) -> Result<Vec<f32>, PluginError>;

    /// Streaming chat completion feeding a bounded channel. Not required
    /// by core diagnosis; interactive surfaces use it.
    async fn send_streaming_message(
        &self,
        ctx: &CallContext,
        request: ChatRequest,
    ) -> Result<StreamReceiver, PluginError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors() {
        assert_eq!(ChatMessage::system("s").role, ChatRole::System);
        assert_eq!(ChatMessage::user("u").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("a").role, ChatRole::Assistant);
    }

    #[test]
    fn response_format_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ResponseFormat::JsonObject).unwrap(),
            "\"json_object\""
        );
    }

    #[test]
    fn request_builder_composes() {
        let req = ChatRequest::new(vec![ChatMessage::user("hi")])
            .with_temperature(0.2)
            .with_max_tokens(512)
            .expecting_json();
        assert_eq!(req.temperature, Some(0.2));
        assert_eq!(req.max_tokens, Some(512));
        assert_eq!(req.response_format, Some(ResponseFormat::JsonObject));
    }
}
