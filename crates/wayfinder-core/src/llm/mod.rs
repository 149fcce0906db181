//! LLM providers
//!
//! This module provides:
//! - The `ProviderClient` trait every backend implements
//! - OpenAI-compatible, Anthropic and offline echo backends
//! - `ProviderRegistry`, built once from configuration
//! - Provider-neutral request/response types

mod anthropic;
mod echo;
mod openai;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use echo::EchoProvider;
pub use openai::{OPENROUTER_BASE_URL, OpenAiCompatibleProvider, OpenAiCompatibleProviderBuilder};
pub use provider::{ProviderClient, ProviderError, ProviderKind, ProviderRegistry};
pub use types::{
    ChatRequest, ChatResponse, Choice, DEFAULT_EXPECTED_OUTPUT_TOKENS, FinishReason,
    GenerateRequest, GenerateResponse, Message, MessageRole, Usage,
};
