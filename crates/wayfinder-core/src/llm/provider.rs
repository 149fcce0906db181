//! Provider abstraction and registry
//!
//! Every backend implements [`ProviderClient`]. The set of backends is closed
//! ([`ProviderKind`]) and the registry is built once at startup from the
//! `[[providers]]` configuration section.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::routing::{Capability, ModelDescriptor};

use super::anthropic::AnthropicProvider;
use super::echo::EchoProvider;
use super::openai::OpenAiCompatibleProvider;
use super::types::{GenerateRequest, GenerateResponse};

/// Errors returned by a single provider call
///
/// The `Display` form never includes the provider's response payload; the
/// body of an HTTP error is kept for debug logging only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("rate limited (retry after {0}s)")]
    RateLimited(u64),

    #[error("unauthorized: check the provider API key")]
    Unauthorized,

    #[error("provider returned HTTP {status}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("model '{0}' is not served by this provider")]
    UnsupportedModel(String),
}

impl ProviderError {
    /// Short, caller-facing description
    pub fn short_message(&self) -> String {
        match self {
            Self::Timeout(_) => "provider timed out".to_string(),
            Self::RateLimited(_) => "provider rate limited the request".to_string(),
            Self::Unauthorized => "provider rejected the credentials".to_string(),
            Self::Http { status, .. } => format!("provider returned HTTP {}", status),
            Self::Network(_) => "provider unreachable".to_string(),
            Self::InvalidResponse(_) => "provider sent an unusable response".to_string(),
            Self::UnsupportedModel(model) => format!("model '{}' unavailable", model),
        }
    }

    /// Whether trying again later (or elsewhere) can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited(_) | Self::Network(_) => true,
            Self::InvalidResponse(_) => true,
            Self::Http { status, .. } => *status == 408 || *status >= 500,
            Self::Unauthorized | Self::UnsupportedModel(_) => false,
        }
    }
}

/// Uniform interface over one provider's API
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Registry name of this provider (e.g. "openrouter")
    fn name(&self) -> &str;

    /// Run one generation against `model`
    async fn generate(
        &self,
        model: &ModelDescriptor,
        request: &GenerateRequest,
    ) -> std::result::Result<GenerateResponse, ProviderError>;

    /// Estimated USD cost of running `request` on `model`
    fn estimate_cost(&self, model: &ModelDescriptor, request: &GenerateRequest) -> f64 {
        model.estimate_cost(
            request.estimated_input_tokens() as u32,
            request.expected_output_tokens() as u32,
        )
    }

    /// Capabilities this provider exposes for `model`
    fn capabilities(&self, model: &ModelDescriptor) -> BTreeSet<Capability> {
        model.capabilities.clone()
    }
}

/// Closed set of provider implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions (OpenRouter, OpenAI, Groq, Together, Ollama)
    OpenAiCompatible,
    /// Anthropic Messages API
    Anthropic,
    /// Offline provider that echoes the prompt back
    Echo,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAiCompatible => write!(f, "open_ai_compatible"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Echo => write!(f, "echo"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "open_ai_compatible" | "openai_compatible" | "openai" => {
                Ok(ProviderKind::OpenAiCompatible)
            }
            "anthropic" => Ok(ProviderKind::Anthropic),
            "echo" => Ok(ProviderKind::Echo),
            other => Err(Error::InvalidInput(format!(
                "unknown provider kind '{}'",
                other
            ))),
        }
    }
}

/// Name -> provider map, built once at startup
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderClient>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider (builder style)
    pub fn with_provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.register(provider);
        self
    }

    /// Add a provider, replacing any existing one with the same name
    pub fn register(&mut self, provider: Arc<dyn ProviderClient>) {
        let name = provider.name().to_string();
        if self.providers.insert(name.clone(), provider).is_some() {
            warn!(provider = %name, "Provider registered twice, keeping the latest");
        }
    }

    /// Build the registry from configuration
    ///
    /// Providers whose API key environment variable is unset are skipped with
    /// a warning; routing treats their models as unavailable.
    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self> {
        let mut registry = Self::new();

        for config in configs {
            let api_key = match &config.api_key_env {
                Some(var) => match std::env::var(var) {
                    Ok(key) if !key.trim().is_empty() => Some(key),
                    _ => {
                        warn!(
                            provider = %config.name,
                            env = %var,
                            "API key not set, provider disabled"
                        );
                        continue;
                    }
                },
                None => None,
            };

            let provider: Arc<dyn ProviderClient> = match config.kind {
                ProviderKind::OpenAiCompatible => {
                    let mut builder = OpenAiCompatibleProvider::builder(&config.name)
                        .timeout_secs(config.timeout_secs);
                    if let Some(url) = &config.base_url {
                        builder = builder.base_url(url);
                    }
                    if let Some(key) = api_key {
                        builder = builder.api_key(key);
                    }
                    Arc::new(builder.build()?)
                }
                ProviderKind::Anthropic => {
                    let key = api_key.ok_or_else(|| {
                        Error::ConfigError(format!(
                            "provider '{}' (anthropic) requires api_key_env",
                            config.name
                        ))
                    })?;
                    let mut provider =
                        AnthropicProvider::new(&config.name, key, config.timeout_secs)?;
                    if let Some(url) = &config.base_url {
                        provider = provider.with_base_url(url);
                    }
                    Arc::new(provider)
                }
                ProviderKind::Echo => Arc::new(EchoProvider::new(&config.name)),
            };

            debug!(provider = %config.name, kind = %config.kind, "Registered provider");
            registry.register(provider);
        }

        info!(providers = registry.len(), "Provider registry ready");
        Ok(registry)
    }

    /// Look up a provider by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderClient>> {
        self.providers.get(name).cloned()
    }

    /// Whether a provider is registered
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered provider names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Map a non-success HTTP status to a provider error
pub(crate) fn error_for_status(
    status: u16,
    body: String,
    retry_after: Option<u64>,
    model: &str,
) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Unauthorized,
        404 => ProviderError::UnsupportedModel(model.to_string()),
        429 => ProviderError::RateLimited(
            retry_after
                .or_else(|| extract_retry_after(&body))
                .unwrap_or(60),
        ),
        _ => ProviderError::Http { status, body },
    }
}

/// Map a transport failure to a provider error
pub(crate) fn error_for_transport(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else if err.is_decode() {
        ProviderError::InvalidResponse(err.to_string())
    } else {
        ProviderError::Network(err.to_string())
    }
}

/// Read a `Retry-After` header given in seconds
pub(crate) fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Extract retry-after value from an error body
fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    if let Some(retry_after) = json.get("retry_after").and_then(|v| v.as_u64()) {
        return Some(retry_after);
    }
    json.get("error")
        .and_then(|e| e.get("retry_after"))
        .and_then(|v| v.as_u64())
}
