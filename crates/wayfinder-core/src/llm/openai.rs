//! OpenAI-compatible chat completions provider
//!
//! Covers OpenRouter (the default base URL), OpenAI, Groq, Together and a
//! local Ollama server; they all speak the same `/chat/completions` shape.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tracing::debug;

use crate::error::{Error, Result};
use crate::routing::ModelDescriptor;

use super::provider::{
    ProviderClient, ProviderError, error_for_status, error_for_transport, retry_after_header,
};
use super::types::{ChatRequest, ChatResponse, GenerateRequest, GenerateResponse};

/// OpenRouter API base URL
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Default HTTP timeout when none is configured
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Provider for any OpenAI-compatible endpoint
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    name: String,
    http_client: HttpClient,
    /// Bearer token; local servers such as Ollama need none
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
}

impl std::fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

/// Builder for creating an OpenAiCompatibleProvider
pub struct OpenAiCompatibleProviderBuilder {
    name: String,
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

impl OpenAiCompatibleProviderBuilder {
    /// Set the API key
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the base URL (defaults to OpenRouter)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the request timeout
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Build the provider
    pub fn build(self) -> Result<OpenAiCompatibleProvider> {
        let timeout = Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));

        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        let base_url = self
            .base_url
            .unwrap_or_else(|| OPENROUTER_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(OpenAiCompatibleProvider {
            name: self.name,
            http_client,
            api_key: self.api_key,
            base_url,
            timeout,
        })
    }
}

impl OpenAiCompatibleProvider {
    /// Create a new builder
    pub fn builder(name: impl Into<String>) -> OpenAiCompatibleProviderBuilder {
        OpenAiCompatibleProviderBuilder {
            name: name.into(),
            api_key: None,
            base_url: None,
            timeout_secs: None,
        }
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a single request to the API
    async fn send_request(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<GenerateResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let mut builder = self
            .http_client
            .post(&url)
            .header("X-Title", "Wayfinder")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| error_for_transport(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            debug!(provider = %self.name, status = status.as_u16(), body = %body, "Provider error response");
            return Err(error_for_status(
                status.as_u16(),
                body,
                retry_after,
                &request.model,
            ));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {}", e)))?;

        chat_response
            .into_generate_response()
            .ok_or_else(|| ProviderError::InvalidResponse("empty response".to_string()))
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        model: &ModelDescriptor,
        request: &GenerateRequest,
    ) -> std::result::Result<GenerateResponse, ProviderError> {
        let chat_request = ChatRequest::from_generate(&model.id, request);
        let mut response = self.send_request(&chat_request).await?;

        // Some gateways omit usage; fall back to the character estimate.
        if response.input_tokens == 0 && response.output_tokens == 0 {
            response.input_tokens = request.estimated_input_tokens() as u32;
            response.output_tokens = response.content.len().div_ceil(4) as u32;
        }
        Ok(response)
    }
}
