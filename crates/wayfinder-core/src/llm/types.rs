//! LLM request/response types
//!
//! `GenerateRequest` / `GenerateResponse` are the provider-neutral shapes the
//! router works with. The chat completion types below them match the
//! OpenAI-compatible wire format used by OpenRouter, OpenAI, Groq and Ollama.

use serde::{Deserialize, Serialize};

use crate::cost::TokenUsage;

/// Output tokens assumed when a request does not cap `max_tokens`
pub const DEFAULT_EXPECTED_OUTPUT_TOKENS: usize = 1024;

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message (instructions/context)
    System,
    /// User message (human input)
    User,
    /// Assistant message (LLM response)
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: MessageRole,
    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new message
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// A provider-neutral generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// The user prompt
    pub prompt: String,
    /// Optional system instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Sampling temperature (0.0 to 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

impl GenerateRequest {
    /// Create a request for a single prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set the system instructions
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Build the chat transcript for this request
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(self.prompt.clone()));
        messages
    }

    /// Rough input token estimate (~4 characters per token)
    pub fn estimated_input_tokens(&self) -> usize {
        let chars = self.prompt.len() + self.system.as_ref().map_or(0, |s| s.len());
        chars.div_ceil(4).max(1)
    }

    /// Output tokens to budget for
    pub fn expected_output_tokens(&self) -> usize {
        self.max_tokens.unwrap_or(DEFAULT_EXPECTED_OUTPUT_TOKENS)
    }
}

/// Reason for completion finishing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop (end of response)
    Stop,
    /// Max tokens reached
    Length,
    /// Tool/function calls requested
    ToolCalls,
    /// Content filtered by safety system
    ContentFilter,
    /// Error occurred
    Error,
    /// Unknown reason (catch-all)
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Length => write!(f, "length"),
            FinishReason::ToolCalls => write!(f, "tool_calls"),
            FinishReason::ContentFilter => write!(f, "content_filter"),
            FinishReason::Error => write!(f, "error"),
            FinishReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// A provider-neutral generation response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// The generated content
    pub content: String,
    /// Model that generated the response
    pub model: String,
    /// Input tokens
    pub input_tokens: u32,
    /// Output tokens
    pub output_tokens: u32,
    /// Reason for stopping
    pub finish_reason: FinishReason,
}

impl GenerateResponse {
    /// Create a response with zero usage (useful for local providers)
    pub fn new(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        }
    }

    /// Set token usage
    pub fn with_usage(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    /// Token usage of this response
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }

    /// Total tokens used (input + output)
    pub fn tokens_used(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Request body for OpenAI-compatible chat completions
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model identifier (e.g., "openai/gpt-4o-mini")
    pub model: String,
    /// List of messages in the conversation
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 to 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

impl ChatRequest {
    /// Build the wire request for a model
    pub fn from_generate(model: impl Into<String>, request: &GenerateRequest) -> Self {
        Self {
            model: model.into(),
            messages: request.messages(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

/// Token usage information from the API response
#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    /// Number of tokens in the prompt
    pub prompt_tokens: u32,
    /// Number of tokens in the completion
    pub completion_tokens: u32,
    /// Total tokens used
    #[serde(default)]
    pub total_tokens: u32,
}

/// A single completion choice from the API response
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    /// Index of this choice
    pub index: usize,
    /// The generated message
    pub message: Message,
    /// Reason the generation stopped
    pub finish_reason: Option<FinishReason>,
}

/// Response from the chat completions API
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    /// Unique identifier for this completion
    #[serde(default)]
    pub id: String,
    /// Model used for the completion
    pub model: String,
    /// List of completion choices
    pub choices: Vec<Choice>,
    /// Token usage information
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Convert into a provider-neutral response, `None` when no choice came back
    pub fn into_generate_response(self) -> Option<GenerateResponse> {
        let usage = self.usage;
        let choice = self.choices.into_iter().next()?;

        Some(GenerateResponse {
            content: choice.message.content,
            model: self.model,
            input_tokens: usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            finish_reason: choice.finish_reason.unwrap_or(FinishReason::Unknown),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("x").role, MessageRole::System);
        assert_eq!(Message::user("x").role, MessageRole::User);
        assert_eq!(Message::assistant("x").role, MessageRole::Assistant);
    }

    #[test]
    fn test_generate_request_messages_include_system_first() {
        let request = GenerateRequest::new("hello").with_system("be brief");
        let messages = request.messages();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[1].content, "hello");
    }

    #[test]
    fn test_token_estimates() {
        let request = GenerateRequest::new("a".repeat(400)).with_max_tokens(200);
        assert_eq!(request.estimated_input_tokens(), 100);
        assert_eq!(request.expected_output_tokens(), 200);

        let unbounded = GenerateRequest::new("hi");
        assert_eq!(unbounded.estimated_input_tokens(), 1);
        assert_eq!(
            unbounded.expected_output_tokens(),
            DEFAULT_EXPECTED_OUTPUT_TOKENS
        );
    }

    #[test]
    fn test_chat_response_conversion() {
        let json = r#"{
            "id": "gen-1",
            "model": "openai/gpt-4o-mini",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "Hi!"}, "finish_reason": "stop"}
            ],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;

        let response: ChatResponse = serde_json::from_str(json).unwrap();
        let converted = response.into_generate_response().unwrap();

        assert_eq!(converted.content, "Hi!");
        assert_eq!(converted.input_tokens, 12);
        assert_eq!(converted.output_tokens, 3);
        assert_eq!(converted.finish_reason, FinishReason::Stop);
        assert_eq!(converted.tokens_used(), 15);
    }

    #[test]
    fn test_chat_response_without_choices() {
        let json = r#"{"model": "m", "choices": []}"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(response.into_generate_response().is_none());
    }

    #[test]
    fn test_unknown_finish_reason() {
        let reason: FinishReason = serde_json::from_str("\"something_new\"").unwrap();
        assert_eq!(reason, FinishReason::Unknown);
    }
}
