//! Backend abstractions and the conversation data model.
//!
//! The [`ChatBackend`] trait is the uniform surface over the two wire
//! dialects. Both dialects normalise to the same response shape: an
//! assistant message possibly carrying an ordered list of tool calls.

pub mod orchestrator;
pub mod providers;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::events::DeltaFrame;

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content (may be empty on tool-calling assistant turns).
    pub content: String,
    /// Tool call id this message answers (tool role only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls made by the assistant (assistant role only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Create an assistant message carrying tool calls.
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        }
    }

    /// Create a tool result message answering `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
    /// Tool result.
    Tool,
}

/// A tool call emitted by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Stable identifier for this call; tool results reference it.
    pub id: String,
    /// Type of tool (always "function").
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    /// Function details.
    pub function: ToolCallFunction,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Construct a function call.
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Function details in a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    /// Function name.
    pub name: String,
    /// Arguments as a JSON string.
    pub arguments: String,
}

/// Tool-choice policy for one backend call.
///
/// Always sent explicitly: `auto` on normal iterations, `none` on final
/// synthesis, `required` only when the orchestrator asks for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// The model decides whether to call tools.
    #[default]
    Auto,
    /// The model must call at least one tool.
    Required,
    /// The model must not call tools.
    None,
}

impl ToolChoice {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Required => "required",
            Self::None => "none",
        }
    }
}

/// Per-call options threaded through the adapter.
///
/// The model override is scoped to one call and never touches shared state,
/// so there is nothing to restore on error paths.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Sampling temperature.
    pub temperature: f32,
    /// Tool-choice policy for this call.
    pub tool_choice: ToolChoice,
    /// Model name overriding the configured default, if any.
    pub model_override: Option<String>,
}

/// The normalised result of one non-streaming backend call.
#[derive(Debug, Clone, Default)]
pub struct AssistantTurn {
    /// Assistant text content.
    pub content: String,
    /// Tool calls in the order the model emitted them.
    pub tool_calls: Vec<ToolCall>,
}

/// Outcome of a backend health probe.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Human-readable diagnostic.
    pub message: String,
    /// Models the backend reports as available.
    pub models: Vec<String>,
}

/// Backend error taxonomy.
///
/// Only `Unavailable` conditions are produced after the adapter's own retry
/// loop; HTTP statuses and read timeouts surface directly.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Connection failed after retries, or the service is absent.
    #[error("backend unreachable at {endpoint}: {reason}")]
    Unavailable {
        /// Endpoint that was tried.
        endpoint: String,
        /// Underlying failure.
        reason: String,
    },

    /// Read timeout exceeded.
    #[error("backend request timed out after {seconds}s")]
    Timeout {
        /// The read budget that was exceeded.
        seconds: u64,
    },

    /// Backend answered with an HTTP error status.
    #[error("backend HTTP error {status}: {body}")]
    Http {
        /// Response status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Response was not JSON or missed required fields.
    #[error("backend protocol error: {detail}")]
    Protocol {
        /// What was malformed.
        detail: String,
    },

    /// The service is reachable but reports no loaded model.
    #[error("backend at {endpoint} is running but reports no loaded model")]
    NoModelLoaded {
        /// Endpoint that was probed.
        endpoint: String,
    },
}

/// A stream of normalised delta frames from the backend.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaFrame, BackendError>> + Send>>;

/// Observability hook invoked with `(backend_name, outgoing_payload)` right
/// before transmission. Panics inside the hook are caught and logged; they
/// never reach the adapter.
pub type RequestHook = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// Uniform request/response surface over both backend dialects.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One non-streaming chat call, normalised.
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
        opts: &CallOptions,
    ) -> Result<AssistantTurn, BackendError>;

    /// One streaming chat call, as a stream of delta frames.
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
        opts: &CallOptions,
    ) -> Result<DeltaStream, BackendError>;

    /// Cheap probe of the backend's listing endpoint.
    async fn health(&self) -> Result<HealthReport, BackendError>;

    /// The configured default model.
    fn default_model(&self) -> &str;

    /// Backend name for logs and the request hook.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_choice_wire_names() {
        assert_eq!(ToolChoice::Auto.as_str(), "auto");
        assert_eq!(ToolChoice::Required.as_str(), "required");
        assert_eq!(ToolChoice::None.as_str(), "none");
    }

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::system("s").role, MessageRole::System);
        assert_eq!(Message::user("u").role, MessageRole::User);
        let tool = Message::tool_result("c1", "out");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn tool_call_roundtrips_through_json() {
        let call = ToolCall::function("c1", "echo", r#"{"text":"ping"}"#);
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["type"], "function");
        let back: ToolCall = serde_json::from_value(value).unwrap();
        assert_eq!(back.function.name, "echo");
    }
}
