//! Anthropic Messages API provider

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::routing::ModelDescriptor;

use super::provider::{
    ProviderClient, ProviderError, error_for_status, error_for_transport, retry_after_header,
};
use super::types::{FinishReason, GenerateRequest, GenerateResponse};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

impl MessagesResponse {
    fn into_generate_response(self) -> GenerateResponse {
        let content = self
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        GenerateResponse {
            content,
            model: self.model,
            input_tokens: self.usage.input_tokens,
            output_tokens: self.usage.output_tokens,
            finish_reason: map_stop_reason(self.stop_reason.as_deref()),
        }
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some(_) => FinishReason::Unknown,
        None => FinishReason::Stop,
    }
}

/// Provider for the Anthropic Messages API
#[derive(Clone)]
pub struct AnthropicProvider {
    name: String,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30).min(timeout))
            .build()
            .map_err(|e| Error::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            client,
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
            timeout,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ProviderClient for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        model: &ModelDescriptor,
        request: &GenerateRequest,
    ) -> std::result::Result<GenerateResponse, ProviderError> {
        let body = MessagesRequest {
            model: &model.id,
            messages: vec![AnthropicMessage {
                role: "user",
                content: &request.prompt,
            }],
            // The Messages API requires an explicit cap.
            max_tokens: request.expected_output_tokens(),
            system: request.system.as_deref(),
            temperature: request.temperature,
        };

        debug!(provider = %self.name, model = %model.id, "Sending messages request");

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| error_for_transport(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let text = response.text().await.unwrap_or_default();
            debug!(provider = %self.name, status = status.as_u16(), body = %text, "Provider error response");
            return Err(error_for_status(status.as_u16(), text, retry_after, &model.id));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {}", e)))?;

        let generated = parsed.into_generate_response();
        if generated.content.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "response had no text content".to_string(),
            ));
        }
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing_joins_text_blocks() {
        let json = r#"{
            "id": "msg_1",
            "type": "message",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "t1", "name": "x", "input": {}},
                {"type": "text", "text": " world"}
            ],
            "model": "claude-3-5-haiku",
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 9, "output_tokens": 2}
        }"#;

        let parsed: MessagesResponse = serde_json::from_str(json).unwrap();
        let response = parsed.into_generate_response();

        assert_eq!(response.content, "Hello world");
        assert_eq!(response.finish_reason, FinishReason::Length);
        assert_eq!(response.input_tokens, 9);
        assert_eq!(response.output_tokens, 2);
    }

    #[test]
    fn test_request_serialization() {
        let body = MessagesRequest {
            model: "claude-3-5-haiku",
            messages: vec![AnthropicMessage {
                role: "user",
                content: "hi",
            }],
            max_tokens: 64,
            system: Some("terse"),
            temperature: None,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["system"], "terse");
        assert_eq!(json["max_tokens"], 64);
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_base_url_override() {
        let provider = AnthropicProvider::new("anthropic", "key", 30)
            .unwrap()
            .with_base_url("http://localhost:9000/v1/");
        assert_eq!(provider.base_url, "http://localhost:9000/v1");
    }
}
