//! Native local-inference dialect driver.
//!
//! Speaks the `/api/chat` protocol: tool arguments travel as JSON objects
//! rather than strings, tool calls carry no ids, and streaming responses
//! are NDJSON frames with a `done` flag instead of SSE.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::config::BackendSettings;
use crate::events::DeltaFrame;
use crate::llm::{
    AssistantTurn, BackendError, CallOptions, ChatBackend, DeltaStream, HealthReport, Message,
    MessageRole, RequestHook, ToolCall,
};

use super::{ensure_success, fire_hook, send_with_retry, truncate_for_log};

/// Driver for the native backend dialect.
pub struct NativeBackend {
    settings: BackendSettings,
    client: reqwest::Client,
    hook: Option<RequestHook>,
}

impl std::fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBackend")
            .field("endpoint", &self.settings.endpoint)
            .field("model", &self.settings.model)
            .finish()
    }
}

impl NativeBackend {
    /// Create a new driver from settings.
    pub fn new(settings: BackendSettings, hook: Option<RequestHook>) -> anyhow::Result<Self> {
        let client = super::build_client(&settings)?;
        Ok(Self {
            settings,
            client,
            hook,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.settings.endpoint.trim_end_matches('/'))
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.settings.endpoint.trim_end_matches('/'))
    }

    fn build_payload(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
        opts: &CallOptions,
        stream: bool,
    ) -> serde_json::Value {
        let model = opts
            .model_override
            .as_deref()
            .unwrap_or(&self.settings.model);

        let mut body = json!({
            "model": model,
            "messages": convert_messages(messages),
            "stream": stream,
            "tool_choice": opts.tool_choice.as_str(),
            "options": { "temperature": opts.temperature },
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools.to_vec());
        }
        body
    }
}

/// Convert messages to the native wire shape. Assistant tool-call arguments
/// are objects on this dialect, so the canonical JSON strings are parsed
/// back into values.
fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            let mut obj = json!({
                "role": match msg.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::Tool => "tool",
                },
                "content": msg.content,
            });
            if let Some(ref calls) = msg.tool_calls {
                let wire_calls: Vec<serde_json::Value> = calls
                    .iter()
                    .map(|call| {
                        let arguments: serde_json::Value =
                            serde_json::from_str(&call.function.arguments)
                                .unwrap_or_else(|_| json!({}));
                        json!({
                            "function": {
                                "name": call.function.name,
                                "arguments": arguments,
                            }
                        })
                    })
                    .collect();
                obj["tool_calls"] = serde_json::Value::Array(wire_calls);
            }
            obj
        })
        .collect()
}

/// Normalise native tool calls: synthesize stable ids (the dialect has
/// none) and re-serialise argument objects into canonical JSON strings.
fn normalize_tool_calls(raw: Vec<RawToolCall>) -> Vec<ToolCall> {
    raw.into_iter()
        .enumerate()
        .map(|(i, call)| {
            ToolCall::function(
                format!("call_{i}"),
                call.function.name,
                call.function.arguments.to_string(),
            )
        })
        .collect()
}

#[async_trait]
impl ChatBackend for NativeBackend {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
        opts: &CallOptions,
    ) -> Result<AssistantTurn, BackendError> {
        let body = self.build_payload(messages, tools, opts, false);
        fire_hook(&self.hook, self.name(), &body);

        let url = self.chat_url();
        let response = send_with_retry(&self.settings, || {
            self.client.post(&url).json(&body)
        })
        .await?;
        let response = ensure_success(response).await?;

        let raw = response.text().await.map_err(|e| BackendError::Protocol {
            detail: format!("failed reading response body: {e}"),
        })?;
        let parsed: NativeChatResponse =
            serde_json::from_str(&raw).map_err(|e| {
                tracing::debug!(body = %truncate_for_log(&raw, 1024), "Unparseable backend response");
                BackendError::Protocol {
                    detail: format!("response is not a native chat message: {e}"),
                }
            })?;

        Ok(AssistantTurn {
            content: parsed.message.content.unwrap_or_default(),
            tool_calls: normalize_tool_calls(parsed.message.tool_calls.unwrap_or_default()),
        })
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
        opts: &CallOptions,
    ) -> Result<DeltaStream, BackendError> {
        let body = self.build_payload(messages, tools, opts, true);
        fire_hook(&self.hook, self.name(), &body);

        let url = self.chat_url();
        let response = send_with_retry(&self.settings, || {
            self.client.post(&url).json(&body)
        })
        .await?;
        let response = ensure_success(response).await?;

        let settings = self.settings.clone();
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            // Tool calls never carry indices on this dialect; count them.
            let mut call_index = 0usize;

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(super::classify_transport_error(&e, &settings));
                        return;
                    }
                };
                match std::str::from_utf8(&chunk) {
                    Ok(text) => buffer.push_str(text),
                    Err(e) => {
                        yield Err(BackendError::Protocol {
                            detail: format!("non-UTF-8 stream chunk: {e}"),
                        });
                        return;
                    }
                }

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }

                    let frame: NativeChatResponse = match serde_json::from_str(&line) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!(error = %e, data = %truncate_for_log(&line, 256),
                                "Skipping unparseable stream frame");
                            continue;
                        }
                    };

                    if let Some(content) = frame.message.content {
                        if !content.is_empty() {
                            yield Ok(DeltaFrame::content(content));
                        }
                    }
                    for call in frame.message.tool_calls.unwrap_or_default() {
                        yield Ok(DeltaFrame::ToolCallDelta {
                            index: call_index,
                            id: Some(format!("call_{call_index}")),
                            name: Some(call.function.name),
                            arguments: Some(call.function.arguments.to_string()),
                        });
                        call_index += 1;
                    }
                    if frame.done {
                        yield Ok(DeltaFrame::done());
                        return;
                    }
                }
            }
            yield Ok(DeltaFrame::done());
        };

        Ok(Box::pin(stream))
    }

    async fn health(&self) -> Result<HealthReport, BackendError> {
        let response = self
            .client
            .get(self.tags_url())
            .timeout(super::probe_timeout(&self.settings))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable {
                endpoint: self.settings.endpoint.clone(),
                reason: e.to_string(),
            })?;
        let response = ensure_success(response).await?;

        let listing: TagListing =
            response.json().await.map_err(|e| BackendError::Protocol {
                detail: format!("tag listing is not JSON: {e}"),
            })?;
        let models: Vec<String> = listing.models.into_iter().map(|m| m.name).collect();

        if models.is_empty() {
            return Err(BackendError::NoModelLoaded {
                endpoint: self.settings.endpoint.clone(),
            });
        }

        Ok(HealthReport {
            message: format!("native backend healthy ({} model(s) available)", models.len()),
            models,
        })
    }

    fn default_model(&self) -> &str {
        &self.settings.model
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

#[derive(Debug, Deserialize)]
struct NativeChatResponse {
    #[serde(default)]
    message: RawMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawMessage {
    content: Option<String>,
    tool_calls: Option<Vec<RawToolCall>>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    function: RawFunction,
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TagListing {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_tool_calls_get_synthetic_ids() {
        let raw = r#"{"message":{"content":"","tool_calls":[
            {"function":{"name":"echo","arguments":{"text":"ping"}}},
            {"function":{"name":"calculate","arguments":{"expression":"1+1"}}}
        ]},"done":true}"#;
        let parsed: NativeChatResponse = serde_json::from_str(raw).unwrap();
        let calls = normalize_tool_calls(parsed.message.tool_calls.unwrap());
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[1].id, "call_1");
        assert_eq!(calls[0].function.name, "echo");
        // Arguments become canonical JSON strings.
        let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["text"], "ping");
    }

    #[test]
    fn assistant_arguments_serialize_as_objects() {
        let msgs = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::function("c0", "echo", r#"{"text":"hi"}"#)],
        )];
        let wire = convert_messages(&msgs);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["arguments"]["text"], "hi");
    }

    #[test]
    fn payload_includes_temperature_under_options() {
        let settings = BackendSettings::default();
        let backend = NativeBackend::new(settings, None).unwrap();
        let opts = CallOptions {
            temperature: 0.4,
            ..Default::default()
        };
        let body = backend.build_payload(&[Message::user("hi")], &[], &opts, false);
        assert!((body["options"]["temperature"].as_f64().unwrap() - 0.4).abs() < 1e-6);
        assert_eq!(body["tool_choice"], "auto");
    }
}
