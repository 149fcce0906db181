//! Offline provider that answers without network access
//!
//! Used for dry runs of the CLI and for wiring tests; it reports token usage
//! from the character estimate so cost accounting still moves.

use async_trait::async_trait;

use crate::routing::ModelDescriptor;

use super::provider::{ProviderClient, ProviderError};
use super::types::{GenerateRequest, GenerateResponse};

#[derive(Debug, Clone)]
pub struct EchoProvider {
    name: String,
}

impl EchoProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ProviderClient for EchoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        model: &ModelDescriptor,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        let mut content = request.prompt.trim().to_string();
        if let Some(max) = request.max_tokens {
            // ~4 characters per token
            let limit = max.saturating_mul(4);
            if content.len() > limit {
                let mut cut = limit;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
            }
        }

        let output_tokens = content.len().div_ceil(4) as u32;
        Ok(GenerateResponse::new(&model.id, content)
            .with_usage(request.estimated_input_tokens() as u32, output_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Capability;

    #[tokio::test]
    async fn test_echo_returns_prompt() {
        let provider = EchoProvider::new("echo");
        let model = ModelDescriptor::new("echo/small", "echo").with_capability(Capability::Chat);

        let response = provider
            .generate(&model, &GenerateRequest::new("  ping  "))
            .await
            .unwrap();

        assert_eq!(response.content, "ping");
        assert_eq!(response.model, "echo/small");
        assert_eq!(response.output_tokens, 1);
    }

    #[tokio::test]
    async fn test_echo_respects_max_tokens() {
        let provider = EchoProvider::new("echo");
        let model = ModelDescriptor::new("echo/small", "echo");

        let request = GenerateRequest::new("x".repeat(100)).with_max_tokens(2);
        let response = provider.generate(&model, &request).await.unwrap();

        assert_eq!(response.content.len(), 8);
    }
}
