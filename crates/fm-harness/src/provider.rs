//! LLM provider abstraction.
//!
//! Defines the [`LlmProvider`] trait the run loop talks to, plus the message
//! and completion types shared by every implementation. Concrete providers
//! (Anthropic, OpenAI, ...) live in dependent crates; this crate ships a
//! [`StubProvider`] for wiring and tests.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur when talking to an LLM provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Required API keys or credentials are missing, or the client has not
    /// been set up.
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    /// The provider's API returned an error response.
    #[error("api error: {0}")]
    Api(String),
    /// Rate limited; retry after the indicated delay.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    /// The request timed out.
    #[error("request timed out")]
    Timeout,
    /// Network, serialization, or other unexpected failures.
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// The role of a participant in an LLM conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Context-setting instructions injected by the orchestration layer.
    System,
    /// Input from the human (or triggering system).
    User,
    /// The model's own turns.
    Assistant,
    /// A tool result being fed back to the model.
    Tool,
}

/// A single message in an LLM conversation.
///
/// `tool_call_id` links a [`Role::Tool`] result back to the originating
/// [`ToolInvocation`]; `name` identifies the tool that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
            tool_call_id: None,
        }
    }

    /// Build a tool-result message linked to the call that produced it.
    pub fn tool_result(
        tool_name: impl Into<String>,
        call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: Some(tool_name.into()),
            tool_call_id: Some(call_id.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool definition / invocation
// ---------------------------------------------------------------------------

/// A tool advertised to the model: name, usage description, and a JSON
/// Schema for its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool call the model asked for in a completion.
///
/// `arguments` is the raw JSON-encoded argument object; callers parse and
/// validate it before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

// ---------------------------------------------------------------------------
// Completion request / response
// ---------------------------------------------------------------------------

/// One chat-completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDef>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            system_prompt: None,
            tools: Vec::new(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of turn: this is the model's final answer.
    Stop,
    /// The model wants the listed tool calls executed.
    ToolCalls,
    /// Generation hit the max-token ceiling.
    MaxTokens,
    /// Anything provider-specific that does not map onto the above.
    Other,
}

/// Token accounting for a single request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fold another request's usage into this accumulator.
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Response from a chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Text content; may be `None` when the model only returned tool calls.
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// Async trait implemented per provider.
///
/// Implementations must be `Send + Sync`; the run loop holds one behind an
/// `Arc` and calls it from concurrently-dispatched tasks.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request, with optional tool calling.
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError>;

    /// Human-readable provider name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// StubProvider
// ---------------------------------------------------------------------------

/// A placeholder provider that always returns `NotConfigured`. Used by the
/// daemon when no concrete provider has been wired in, and as a base case in
/// tests.
#[derive(Debug, Clone)]
pub struct StubProvider {
    provider_name: String,
}

impl StubProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            provider_name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for StubProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "{} provider is not configured; install a concrete implementation",
            self.provider_name
        )))
    }

    fn name(&self) -> &str {
        &self.provider_name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_provider_is_not_configured() {
        let provider = StubProvider::new("stub");
        let result = provider
            .complete(CompletionRequest::new(vec![Message::user("hi")]))
            .await;
        assert!(matches!(result, Err(ProviderError::NotConfigured(_))));
        assert_eq!(provider.name(), "stub");
    }

    #[test]
    fn usage_absorb_accumulates() {
        let mut total = TokenUsage::default();
        total.absorb(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        total.absorb(&TokenUsage {
            input_tokens: 3,
            output_tokens: 7,
        });
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 12);
        assert_eq!(total.total(), 25);
    }

    #[test]
    fn tool_result_message_links_call_id() {
        let msg = Message::tool_result("http_request", "call_1", "{\"status\":200}");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("http_request"));
    }
}
