//! OpenAI-compatible HTTP adapter.
//!
//! Speaks the `/chat/completions` and `/embeddings` REST shape that most
//! hosted and self-hosted model servers expose. Streaming consumes the
//! SSE `data:` lines and forwards deltas into the bounded chunk channel.

use super::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, LlmAdapter, ResponseFormat, StreamChunk,
    StreamReceiver, TokenUsage, STREAM_BUFFER_SIZE,
};
use crate::context::CallContext;
use crate::error::PluginError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpLlmConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_timeout", with = "crate::common::duration_serde")]
    pub timeout: Duration,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

pub struct HttpLlmAdapter {
    http: reqwest::Client,
    config: HttpLlmConfig,
}

#[derive(Serialize)]
struct WireChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct WireChatResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Serialize)]
struct WireEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct WireEmbeddingResponse {
    data: Vec<WireEmbedding>,
}

#[derive(Deserialize)]
struct WireEmbedding {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct WireStreamChunk {
    choices: Vec<WireStreamChoice>,
}

#[derive(Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: WireStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl HttpLlmAdapter {
    pub fn new(config: HttpLlmConfig) -> Result<Self, PluginError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| PluginError::invalid(e.to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| PluginError::ConnectFailed {
                message: e.to_string(),
            })?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn wire_request<'a>(&'a self, request: &'a ChatRequest, stream: bool) -> WireChatRequest<'a> {
        WireChatRequest {
            model: &self.config.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: match request.response_format {
                Some(ResponseFormat::JsonObject) => Some(WireResponseFormat {
                    format_type: "json_object",
                }),
                _ => None,
            },
            stream: stream.then_some(true),
        }
    }
}

#[async_trait::async_trait]
impl LlmAdapter for HttpLlmAdapter {
    async fn send_message(
        &self,
        ctx: &CallContext,
        request: ChatRequest,
    ) -> Result<ChatResponse, PluginError> {
        let url = self.url("/chat/completions");
        let body = serde_json::to_value(self.wire_request(&request, false))?;
        let http = self.http.clone();

        let wire: WireChatResponse = ctx
            .run(async move {
                let response = http.post(&url).json(&body).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(PluginError::protocol(format!(
                        "llm endpoint returned {status}: {text}"
                    )));
                }
                Ok(response.json::<WireChatResponse>().await?)
            })
            .await?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| PluginError::protocol("llm response contained no choices"))?;
        let usage = wire.usage.unwrap_or_default();
        Ok(ChatResponse {
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: choice.message.content,
            },
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
            model: wire.model,
        })
    }

    async fn embed(&self, ctx: &CallContext, text: &str) -> Result<Vec<f32>, PluginError> {
        let url = self.url("/embeddings");
        let body = serde_json::to_value(WireEmbeddingRequest {
            model: &self.config.embedding_model,
            input: text,
        })?;
        let http = self.http.clone();

        let wire: WireEmbeddingResponse = ctx
            .run(async move {
                let response = http.post(&url).json(&body).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(PluginError::protocol(format!(
                        "embedding endpoint returned {status}: {text}"
                    )));
                }
                Ok(response.json::<WireEmbeddingResponse>().await?)
            })
            .await?;

        wire.data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| PluginError::protocol("embedding response contained no data"))
    }

    async fn send_streaming_message(
        &self,
        ctx: &CallContext,
        request: ChatRequest,
    ) -> Result<StreamReceiver, PluginError> {
        let url = self.url("/chat/completions");
        let body = serde_json::to_value(self.wire_request(&request, true))?;
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PluginError::protocol(format!(
                "llm endpoint returned {status} for stream request"
            )));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER_SIZE);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            loop {
                let chunk = tokio::select! {
                    _ = ctx.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx.send(Err(PluginError::from(err))).await;
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // SSE events are newline-delimited `data:` lines.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        let _ = tx
                            .send(Ok(StreamChunk {
                                delta: String::new(),
                                done: true,
                            }))
                            .await;
                        return;
                    }
                    match serde_json::from_str::<WireStreamChunk>(data) {
                        Ok(parsed) => {
                            for choice in parsed.choices {
                                let done = choice.finish_reason.is_some();
                                let delta = choice.delta.content.unwrap_or_default();
                                if tx.send(Ok(StreamChunk { delta, done })).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(PluginError::from(err))).await;
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> HttpLlmAdapter {
        HttpLlmAdapter::new(HttpLlmConfig {
            base_url: server.uri(),
            api_key: Some("test-key".to_string()),
            model: "diag-model".to_string(),
            embedding_model: "diag-embed".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn send_message_parses_choice_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "diag-model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "hello"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3},
                "model": "diag-model"
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let response = adapter
            .send_message(
                &CallContext::background(),
                ChatRequest::new(vec![ChatMessage::user("hi")]),
            )
            .await
            .unwrap();

        assert_eq!(response.message.content, "hello");
        assert_eq!(response.usage.prompt_tokens, 12);
        assert_eq!(response.model.as_deref(), Some("diag-model"));
    }

    #[tokio::test]
    async fn json_format_is_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "response_format": {"type": "json_object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{}"}}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let response = adapter
            .send_message(
                &CallContext::background(),
                ChatRequest::new(vec![ChatMessage::user("hi")]).expecting_json(),
            )
            .await
            .unwrap();
        assert_eq!(response.message.content, "{}");
    }

    #[tokio::test]
    async fn server_error_surfaces_as_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let res = adapter
            .send_message(
                &CallContext::background(),
                ChatRequest::new(vec![ChatMessage::user("hi")]),
            )
            .await;
        assert!(matches!(res, Err(PluginError::Protocol { .. })));
    }

    #[tokio::test]
    async fn embed_returns_first_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3]}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let vector = adapter
            .embed(&CallContext::background(), "some text")
            .await
            .unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn streaming_forwards_deltas_until_done() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let mut rx = adapter
            .send_streaming_message(
                &CallContext::background(),
                ChatRequest::new(vec![ChatMessage::user("hi")]),
            )
            .await
            .unwrap();

        let mut collected = String::new();
        let mut saw_done = false;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            collected.push_str(&chunk.delta);
            if chunk.done {
                saw_done = true;
                break;
            }
        }
        assert_eq!(collected, "Hello");
        assert!(saw_done);
    }
}
