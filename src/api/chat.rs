//! The chat-completions endpoint.
//!
//! Validates the incoming body (malformed JSON, missing/empty/non-array
//! `messages`, negative temperature all answer 400 with a well-formed error
//! object), delegates to the orchestrator, and shapes the result as an
//! OpenAI chat completion — non-streaming JSON or an SSE chunk stream
//! terminated by `data: [DONE]`. Unrecoverable backend conditions surface
//! as synthesized completions, never as raw exception text.

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::llm::orchestrator::{StreamPart, TurnRequest};
use crate::llm::{Message, MessageRole, ToolCall, ToolChoice};
use crate::AppState;

/// Create the chat router.
pub fn router() -> Router<AppState> {
    Router::new().route("/v1/chat/completions", post(chat_completions))
}

/// Wire shape of one request message.
#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_call_id: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message })),
    )
        .into_response()
}

async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let Ok(Json(data)) = body else {
        return bad_request("Invalid JSON in request body");
    };

    let Some(messages_value) = data.get("messages") else {
        return bad_request("Missing required field: 'messages'");
    };
    let Some(raw_messages) = messages_value.as_array() else {
        return bad_request("Field 'messages' must be an array");
    };
    if raw_messages.is_empty() {
        return bad_request("Field 'messages' cannot be empty");
    }

    let mut messages = Vec::with_capacity(raw_messages.len());
    for raw in raw_messages {
        let wire: WireMessage = match serde_json::from_value(raw.clone()) {
            Ok(m) => m,
            Err(e) => return bad_request(&format!("Invalid message: {e}")),
        };
        let role = match wire.role.as_str() {
            "system" => MessageRole::System,
            "user" => MessageRole::User,
            "assistant" => MessageRole::Assistant,
            "tool" => MessageRole::Tool,
            other => return bad_request(&format!("Unknown message role: '{other}'")),
        };
        messages.push(Message {
            role,
            content: wire.content.unwrap_or_default(),
            tool_call_id: wire.tool_call_id,
            tool_calls: wire.tool_calls,
        });
    }
    if !matches!(messages[0].role, MessageRole::User | MessageRole::System) {
        return bad_request("The first message must have role 'user' or 'system'");
    }

    let temperature = match data.get("temperature") {
        None => None,
        Some(value) => match value.as_f64() {
            Some(t) if t >= 0.0 => Some(t as f32),
            Some(_) => return bad_request("Field 'temperature' must be >= 0"),
            None => return bad_request("Field 'temperature' must be a number"),
        },
    };

    let tool_choice = match data.get("tool_choice").and_then(|v| v.as_str()) {
        None => None,
        Some("auto") => Some(ToolChoice::Auto),
        Some("required") => Some(ToolChoice::Required),
        Some("none") => Some(ToolChoice::None),
        Some(other) => {
            return bad_request(&format!("Unknown tool_choice: '{other}'"));
        }
    };

    let stream = data
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    // A model differing from both the advertised and the configured name is
    // a per-request override, scoped to this request's backend calls.
    let model_override = data
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|m| {
            *m != state.config.backend.served_model_name && *m != state.config.backend.model
        })
        .map(str::to_string);

    let request = TurnRequest {
        messages,
        temperature,
        tool_choice,
        model_override,
    };
    let served_model = state.config.backend.served_model_name.clone();

    if stream {
        let parts = state.orchestrator.run_streaming(request);
        let model = served_model.clone();
        let sse = parts.flat_map(move |part| {
            let events: Vec<Result<Event, Infallible>> = match part {
                StreamPart::Content(text) => {
                    vec![Ok(Event::default().data(
                        chunk_object(&model, json!({ "content": text }), None).to_string(),
                    ))]
                }
                StreamPart::Done(reason) => vec![
                    Ok(Event::default()
                        .data(chunk_object(&model, json!({}), Some(reason)).to_string())),
                    Ok(Event::default().data("[DONE]")),
                ],
            };
            futures::stream::iter(events)
        });
        Sse::new(sse).into_response()
    } else {
        let outcome = state.orchestrator.run(request).await;
        Json(completion_object(
            &served_model,
            &outcome.content,
            outcome.finish_reason,
        ))
        .into_response()
    }
}

/// One OpenAI-shaped completion object with a single choice.
pub fn completion_object(model: &str, content: &str, finish_reason: &str) -> serde_json::Value {
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [
            {
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": finish_reason,
            }
        ],
        "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 },
    })
}

/// One OpenAI-shaped streaming chunk.
pub fn chunk_object(
    model: &str,
    delta: serde_json::Value,
    finish_reason: Option<&str>,
) -> serde_json::Value {
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [
            {
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_object_has_single_assistant_choice() {
        let value = completion_object("docgate/default", "hello", "stop");
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["role"], "assistant");
        assert_eq!(value["choices"][0]["message"]["content"], "hello");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert!(value["id"].as_str().unwrap().starts_with("chatcmpl-"));
    }

    #[test]
    fn chunk_object_carries_delta_and_reason() {
        let chunk = chunk_object("m", json!({ "content": "hi" }), None);
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hi");
        assert!(chunk["choices"][0]["finish_reason"].is_null());

        let terminal = chunk_object("m", json!({}), Some("stop"));
        assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn wire_message_accepts_tool_fields() {
        let raw = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [
                {"id": "c1", "type": "function",
                 "function": {"name": "echo", "arguments": "{}"}}
            ]
        });
        let wire: WireMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(wire.tool_calls.unwrap()[0].id, "c1");
        assert!(wire.content.is_none());
    }
}
