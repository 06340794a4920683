//! LLM client seam for the agent loop.
//!
//! The provider-specific client lives outside this crate. What lives here is the
//! conversation data model shared with it, the tool-choice policy, and the
//! [`LlmClient`] trait the control loop calls to decide the next step.
//!
//! Provider failures are carried as [`LlmError`] values that already know whether
//! they are worth retrying (see [`ErrorClass`]).

mod error;
mod registry;
mod retry;

pub use error::{classify_http_status, ErrorClass, LlmError, LlmErrorKind, RetryConfig};
pub use registry::ClientRegistry;
pub use retry::RetryingClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the agent's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Name of the tool that produced a `tool` message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base64-encoded image attached to this message (e.g. a screenshot).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64_image: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: Option<String>) -> Self {
        Message {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            base64_image: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, Some(content.into()))
    }

    /// Create an assistant message carrying tool calls and (optionally) text.
    ///
    /// Empty text is stored as `None` so providers don't see a blank content field.
    pub fn from_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let content = content.into();
        let mut msg = Self::with_role(Role::Assistant, (!content.is_empty()).then_some(content));
        msg.tool_calls = tool_calls;
        msg
    }

    /// Create a tool-result message answering `tool_call_id`.
    pub fn tool(
        content: impl Into<String>,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_role(Role::Tool, Some(content.into()));
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(name.into());
        msg
    }

    /// Attach a base64 image to this message.
    pub fn with_image(mut self, base64_image: Option<String>) -> Self {
        self.base64_image = base64_image;
        self
    }

    /// Get the text content of this message.
    pub fn text_content(&self) -> Option<&str> {
        self.content.as_deref()
    }
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Function call details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON string. May be empty or missing for no-argument functions.
    #[serde(default)]
    pub arguments: String,
}

/// Tool definition for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

/// Function definition with schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Whether the model may, must, or must never call a tool on a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// Plain-text replies only; tool calls are a model mistake and are dropped.
    None,
    /// The model decides.
    #[default]
    Auto,
    /// At least one tool call is expected.
    Required,
}

impl ToolChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Auto => "auto",
            Self::Required => "required",
        }
    }
}

/// Everything the model needs to decide the next step.
#[derive(Debug, Clone, Copy)]
pub struct ToolRequest<'a> {
    pub messages: &'a [Message],
    pub system_messages: Option<&'a [Message]>,
    pub tools: &'a [ToolDefinition],
    pub tool_choice: ToolChoice,
}

/// Response from a chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls,
            usage: None,
        }
    }
}

/// Token usage information (if provided by the upstream provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Trait for LLM clients.
///
/// Implementations translate the request into a provider call and return the
/// reply's text and tool calls in order. Failures must be classified: a
/// `LimitExceeded` error ends the agent run gracefully, anything else aborts it.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn ask_tool(&self, request: ToolRequest<'_>) -> Result<ChatResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_tool_call_message_drops_empty_text() {
        let msg = Message::from_tool_calls("", vec![ToolCall::new("c1", "bash", "{}")]);
        assert_eq!(msg.role, Role::Assistant);
        assert!(msg.content.is_none());
        assert_eq!(msg.tool_calls.len(), 1);

        let msg = Message::from_tool_calls("thinking", vec![]);
        assert_eq!(msg.text_content(), Some("thinking"));
    }

    #[test]
    fn test_message_serialization_skips_empty_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hi");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());

        let tool = Message::tool("out", "call_1", "bash");
        let json = serde_json::to_value(tool).unwrap();
        assert_eq!(json["tool_call_id"], "call_1");
        assert_eq!(json["name"], "bash");
    }

    #[test]
    fn test_tool_choice_serde() {
        let choice: ToolChoice = serde_json::from_str("\"required\"").unwrap();
        assert_eq!(choice, ToolChoice::Required);
        assert_eq!(ToolChoice::default(), ToolChoice::Auto);
    }
}
