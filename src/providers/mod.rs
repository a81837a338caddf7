//! LLM provider abstraction.
//!
//! The kernel is provider-agnostic: it speaks to any model through the
//! [`LanguageModel`] trait and never sees a vendor wire format. Concrete
//! providers live with the transport layer; tests substitute mock
//! implementations.

pub mod offline;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::MessageRole;

/// A message handed to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Author role.
    pub role: MessageRole,
    /// Text content.
    pub content: String,
}

impl PromptMessage {
    /// Build a user message.
    pub fn user(content: &str) -> Self {
        Self {
            role: MessageRole::User,
            content: content.to_owned(),
        }
    }

    /// Build an assistant message.
    pub fn assistant(content: &str) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.to_owned(),
        }
    }
}

/// JSON Schema description of a tool the model may call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name, matching the registry entry.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON Schema object for the tool's parameters.
    pub input_schema: serde_json::Value,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Call identifier assigned by the provider.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments as JSON.
    pub arguments: serde_json::Value,
}

/// Why generation stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Normal end of turn.
    EndTurn,
    /// The model wants tool calls executed.
    ToolUse,
    /// Token limit reached.
    MaxTokens,
    /// The provider's safety layer refused to produce output.
    SafetyBlock,
    /// Provider-specific other reason.
    Other(String),
}

/// Token usage for budget accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Tokens in the prompt.
    pub input_tokens: u32,
    /// Tokens generated.
    pub output_tokens: u32,
}

impl UsageStats {
    /// Total tokens consumed by the call.
    pub fn total(&self) -> u64 {
        u64::from(self.input_tokens).saturating_add(u64::from(self.output_tokens))
    }
}

/// A generation request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Conversation including the latest user message.
    pub messages: Vec<PromptMessage>,
    /// System prompt, injected before messages.
    pub system: Option<String>,
    /// Tools the model may call.
    pub tools: Vec<ToolSpec>,
    /// Maximum tokens in the response.
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    /// Build a text-only request with a system prompt.
    pub fn text(system: &str, messages: Vec<PromptMessage>) -> Self {
        Self {
            messages,
            system: Some(system.to_owned()),
            tools: vec![],
            max_tokens: None,
        }
    }
}

/// A generation response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Generated text (may be empty when only tool calls were produced).
    pub text: String,
    /// Tool calls requested by the model.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
    /// Token usage.
    pub usage: UsageStats,
}

/// Errors returned by model providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The call exceeded its deadline.
    #[error("provider call timed out after {0}s")]
    Timeout(u64),
    /// Upstream responded with an error status.
    #[error("provider returned status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitised response body.
        body: String,
    },
    /// Response did not match the expected shape.
    #[error("provider response parse error: {0}")]
    Parse(String),
    /// The provider's safety layer blocked the output. Never retried.
    #[error("provider safety layer blocked the output")]
    SafetyBlocked,
    /// Provider cannot serve the request with current configuration.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures, timeouts and 5xx statuses are transient; safety
    /// blocks, parse errors and 4xx statuses are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            Self::Parse(_) | Self::SafetyBlocked | Self::Unavailable(_) => false,
        }
    }
}

/// Scrub credential-shaped substrings from an upstream error body before
/// it reaches logs or structured errors, and bound its length.
pub fn sanitize_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"(?i)bearer\s+[A-Za-z0-9._\-]{8,}",
        r"sk-[A-Za-z0-9_\-]{20,}",
        r"ghp_[A-Za-z0-9]{20,}",
        r"xox[bp]-[A-Za-z0-9\-]{20,}",
        r"(?i)api[_-]?key[=:\s]+[A-Za-z0-9_\-]{12,}",
    ] {
        if let Ok(regex) = regex::Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

/// A language model collaborator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a completion for the request.
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError>;

    /// Identifier of the model served by this provider.
    fn model_id(&self) -> &str;
}
