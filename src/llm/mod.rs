//! Model-calling layer.
//!
//! The [`LlmDriver`] trait is the streaming seam to the model API. The
//! [`Orchestrator`] is the conversational turn driver: it runs the
//! "model → tool → model" loop over a per-turn tool namespace and streams
//! [`NormalizedEvent`]s to the client.
//!
//! # Drivers
//!
//! - [`ChatCompletionsDriver`]: OpenAI-compatible Chat Completions API

pub mod chat_completions;
pub mod orchestrator;
pub mod provider;

pub use chat_completions::ChatCompletionsDriver;
pub use orchestrator::{Orchestrator, TurnLimits};
pub use provider::Provider;

use crate::normalized::NormalizedEvent;
use futures::Stream;

/// LLM connection and model settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key for authentication.
    pub api_key: Option<String>,
    /// Model identifier (e.g., `gpt-4o`).
    pub model: String,
    /// Provider type (auto-detected from `base_url`).
    pub provider: Provider,
    /// Whether to enable parallel tool calls (provider-dependent).
    pub parallel_tool_calls: Option<bool>,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content. `null` (assistant tool-call turns) reads as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    /// Optional tool call ID (for tool responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Optional tool calls made by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <Option<String> as serde::Deserialize>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(MessageRole::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(MessageRole::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, content)
    }

    fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
    /// Tool response.
    Tool,
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,
    /// Type of tool (always "function" for now).
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    /// Function details.
    pub function: ToolCallFunction,
}

fn default_call_type() -> String {
    "function".to_string()
}

/// Function details in a tool call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCallFunction {
    /// Function name.
    pub name: String,
    /// Arguments as JSON string.
    pub arguments: String,
}

/// Request to an LLM driver.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Conversation messages.
    pub messages: Vec<serde_json::Value>,
    /// Available tools in `OpenAI` function schema format.
    pub tools: Vec<serde_json::Value>,
}

/// Boxed event stream returned by drivers.
pub type DriverStream =
    std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<NormalizedEvent>> + Send>>;

/// Trait for LLM streaming drivers.
///
/// Implementations emit `MessageDelta`, `ToolCallDelta`, one
/// `ToolCallComplete` per assembled call, and `Done` at end of response.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync + std::fmt::Debug {
    /// Stream a response from the LLM.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the connection is interrupted.
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<DriverStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": "what is 2 plus 3?"
        }))
        .unwrap();
        assert_eq!(msg, Message::user("what is 2 plus 3?"));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            serde_json::json!({ "role": "user", "content": "what is 2 plus 3?" })
        );
    }

    #[test]
    fn test_assistant_tool_call_history_parses() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "function": { "name": "calculateSum", "arguments": "{\"a\":2,\"b\":3}" }
            }]
        }))
        .unwrap();
        assert_eq!(msg.content, "");
        let calls = msg.tool_calls.unwrap();
        assert_eq!(calls[0].call_type, "function");
        assert_eq!(calls[0].function.name, "calculateSum");

        let msg: Message = serde_json::from_value(serde_json::json!({
            "role": "assistant",
            "tool_calls": []
        }))
        .unwrap();
        assert_eq!(msg.content, "");
    }
}
