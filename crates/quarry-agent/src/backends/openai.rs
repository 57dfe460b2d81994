use super::{LlmBackend, LlmCompletion};
use crate::config::{LlmProvider, ModelConfig};
use crate::stream::StreamEvent;
use async_trait::async_trait;
use futures_util::StreamExt;
use quarry_core::{Message, QuarryError, QuarryResult, TokenUsage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// OpenAI-compatible API backend.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama, and any other provider
/// that implements the OpenAI chat completions API.
pub struct OpenAiBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: ModelConfig) -> QuarryResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| QuarryError::Http(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn build_messages(&self, messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content
                })
            })
            .collect()
    }

    fn build_body(&self, messages: &[Message], stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": self.build_messages(messages),
        });
        if stream {
            body["stream"] = serde_json::json!(true);
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json");

        // OpenRouter attributes traffic through these headers
        if matches!(self.config.provider, LlmProvider::OpenRouter) {
            request
                .header("HTTP-Referer", "https://github.com/quarry-research/quarry")
                .header("X-Title", "Quarry")
        } else {
            request
        }
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url())
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    async fn chat(&self, messages: &[Message]) -> QuarryResult<LlmCompletion> {
        let body = self.build_body(messages, false);
        let request = self.add_provider_headers(self.http.post(self.url()));

        let resp = request
            .json(&body)
            .send()
            .await
            .map_err(|e| QuarryError::Http(e.to_string()))?;

        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| QuarryError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(QuarryError::Llm(format!(
                "API error {status}: {resp_body}"
            )));
        }

        parse_openai_response(&resp_body)
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
    ) -> QuarryResult<(
        mpsc::Receiver<StreamEvent>,
        JoinHandle<QuarryResult<LlmCompletion>>,
    )> {
        let body = self.build_body(messages, true);
        let request = self.add_provider_headers(self.http.post(self.url()));

        let resp = request
            .json(&body)
            .send()
            .await
            .map_err(|e| QuarryError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(QuarryError::Llm(format!(
                "API error {status}: {error_body}"
            )));
        }

        let (tx, rx) = mpsc::channel::<StreamEvent>(256);
        let byte_stream = resp.bytes_stream();

        let handle = tokio::spawn(async move {
            let mut stream = byte_stream;
            let mut buffer = String::new();
            let mut full_text = String::new();
            let mut usage = TokenUsage::default();

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                message: format!("Stream read error: {e}"),
                            })
                            .await;
                        return Err(QuarryError::Http(format!("Stream read error: {e}")));
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        let _ = tx.send(StreamEvent::Done).await;
                        continue;
                    }

                    let event: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(error = %e, "Skipping malformed stream chunk");
                            continue;
                        }
                    };

                    if let Some(u) = parse_usage(&event["usage"]) {
                        usage = u;
                    }

                    if let Some(content) = event["choices"][0]["delta"]["content"].as_str() {
                        if !content.is_empty() {
                            full_text.push_str(content);
                            let _ = tx
                                .send(StreamEvent::TextDelta {
                                    text: content.to_string(),
                                })
                                .await;
                        }
                    }
                }
            }

            Ok(LlmCompletion::new(full_text, usage))
        });

        Ok((rx, handle))
    }
}

fn parse_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let input = value["prompt_tokens"].as_u64()?;
    let output = value["completion_tokens"].as_u64().unwrap_or(0);
    Some(TokenUsage::new(input, output))
}

pub fn parse_openai_response(body: &serde_json::Value) -> QuarryResult<LlmCompletion> {
    let choice = body["choices"]
        .get(0)
        .ok_or_else(|| QuarryError::Llm(format!("response has no choices: {body}")))?;
    let content = choice["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let usage = parse_usage(&body["usage"]).unwrap_or_default();
    Ok(LlmCompletion::new(content, usage))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> ModelConfig {
        ModelConfig {
            provider: LlmProvider::OpenAi,
            model_id: "openai/gpt-4o-mini".into(),
            api_key: "sk-test".into(),
            api_base_url: Some(server.uri()),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_parse_response_with_usage() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        });
        let completion = parse_openai_response(&body).unwrap();
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.usage, TokenUsage::new(12, 3));
    }

    #[test]
    fn test_parse_response_without_choices() {
        let body = serde_json::json!({"error": "oops"});
        assert!(matches!(
            parse_openai_response(&body),
            Err(QuarryError::Llm(_))
        ));
    }

    #[tokio::test]
    async fn test_chat_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "pong"}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 1}
            })))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(config_for(&server)).unwrap();
        let completion = backend.chat(&[Message::user("ping")]).await.unwrap();
        assert_eq!(completion.content, "pong");
        assert_eq!(completion.usage.input_tokens, 5);
    }

    #[tokio::test]
    async fn test_chat_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(serde_json::json!({"error": "slow down"})),
            )
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(config_for(&server)).unwrap();
        let err = backend.chat(&[Message::user("ping")]).await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn test_chat_stream_collects_deltas_and_usage() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(config_for(&server)).unwrap();
        let (mut rx, handle) = backend.chat_stream(&[Message::user("hi")]).await.unwrap();

        let mut deltas = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::TextDelta { text } = event {
                deltas.push(text);
            }
        }
        let completion = handle.await.unwrap().unwrap();
        assert_eq!(deltas.concat(), "Hello");
        assert_eq!(completion.content, "Hello");
        assert_eq!(completion.usage, TokenUsage::new(7, 2));
    }
}
