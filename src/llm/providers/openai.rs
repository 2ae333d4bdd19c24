//! OpenAI-compatible dialect driver.
//!
//! Speaks `/chat/completions` against any OpenAI-style local server.
//! Streaming responses are SSE: each event line is `data: <json frame>`,
//! terminated by the `data: [DONE]` sentinel.

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

/// Driver for OpenAI-compatible servers.
pub struct OpenAiCompatibleBackend {
    settings: BackendSettings,
    client: reqwest::Client,
    hook: Option<RequestHook>,
}

impl std::fmt::Debug for OpenAiCompatibleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleBackend")
            .field("endpoint", &self.settings.endpoint)
            .field("model", &self.settings.model)
            .finish()
    }
}

impl OpenAiCompatibleBackend {
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
        format!(
            "{}/chat/completions",
            self.settings.endpoint.trim_end_matches('/')
        )
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.settings.endpoint.trim_end_matches('/'))
    }

    /// Build the request payload. `tool_choice` is always explicit, even
    /// when no tools are offered.
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
            "temperature": opts.temperature,
            "stream": stream,
            "tool_choice": opts.tool_choice.as_str(),
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools.to_vec());
        }
        body
    }
}

/// Convert messages to the OpenAI wire shape.
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
            if let Some(ref id) = msg.tool_call_id {
                obj["tool_call_id"] = serde_json::Value::String(id.clone());
            }
            if let Some(ref calls) = msg.tool_calls {
                obj["tool_calls"] = serde_json::to_value(calls).unwrap_or_default();
            }
            obj
        })
        .collect()
}

#[async_trait]
impl ChatBackend for OpenAiCompatibleBackend {
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
        let parsed: ChatCompletionResponse =
            serde_json::from_str(&raw).map_err(|e| {
                tracing::debug!(body = %truncate_for_log(&raw, 1024), "Unparseable backend response");
                BackendError::Protocol {
                    detail: format!("response is not a chat completion: {e}"),
                }
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Protocol {
                detail: "response carries no choices".to_string(),
            })?;

        Ok(AssistantTurn {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
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

                // Process complete SSE lines; an event ends at a blank line.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data.trim() == "[DONE]" {
                        yield Ok(DeltaFrame::done());
                        return;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(chunk) => {
                            for frame in chunk.into_frames() {
                                yield Ok(frame);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, data = %truncate_for_log(data, 256),
                                "Skipping unparseable stream frame");
                        }
                    }
                }
            }
            // Stream ended without the sentinel; still terminate cleanly.
            yield Ok(DeltaFrame::done());
        };

        Ok(Box::pin(stream))
    }

    async fn health(&self) -> Result<HealthReport, BackendError> {
        let response = self
            .client
            .get(self.models_url())
            .timeout(super::probe_timeout(&self.settings))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable {
                endpoint: self.settings.endpoint.clone(),
                reason: e.to_string(),
            })?;
        let response = ensure_success(response).await?;

        let listing: ModelListing =
            response.json().await.map_err(|e| BackendError::Protocol {
                detail: format!("model listing is not JSON: {e}"),
            })?;
        let models: Vec<String> = listing.data.into_iter().map(|m| m.id).collect();

        if models.is_empty() {
            return Err(BackendError::NoModelLoaded {
                endpoint: self.settings.endpoint.clone(),
            });
        }

        Ok(HealthReport {
            message: format!(
                "openai-compatible backend healthy ({} model(s) loaded)",
                models.len()
            ),
            models,
        })
    }

    fn default_model(&self) -> &str {
        &self.settings.model
    }

    fn name(&self) -> &'static str {
        "openai-compatible"
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// One SSE frame of a streaming chat completion.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

impl StreamChunk {
    fn into_frames(self) -> Vec<DeltaFrame> {
        let mut frames = Vec::new();
        for choice in self.choices {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content {
                    if !content.is_empty() {
                        frames.push(DeltaFrame::content(content));
                    }
                }
                if let Some(calls) = delta.tool_calls {
                    for call in calls {
                        frames.push(DeltaFrame::ToolCallDelta {
                            index: call.index,
                            id: call.id,
                            name: call.function.as_ref().and_then(|f| f.name.clone()),
                            arguments: call.function.as_ref().and_then(|f| f.arguments.clone()),
                        });
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                frames.push(DeltaFrame::done_with_reason(reason));
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolChoice;

    fn backend() -> OpenAiCompatibleBackend {
        OpenAiCompatibleBackend::new(BackendSettings::default(), None).unwrap()
    }

    #[test]
    fn payload_always_carries_tool_choice() {
        let b = backend();
        let opts = CallOptions {
            temperature: 0.0,
            tool_choice: ToolChoice::None,
            model_override: None,
        };
        let body = b.build_payload(&[Message::user("hi")], &[], &opts, false);
        assert_eq!(body["tool_choice"], "none");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn model_override_is_call_scoped() {
        let b = backend();
        let opts = CallOptions {
            model_override: Some("other-model".to_string()),
            ..Default::default()
        };
        let body = b.build_payload(&[Message::user("hi")], &[], &opts, false);
        assert_eq!(body["model"], "other-model");

        // A following call without the override sees the configured model.
        let body = b.build_payload(&[Message::user("hi")], &[], &CallOptions::default(), false);
        assert_eq!(body["model"], b.settings.model);
    }

    #[test]
    fn tool_messages_keep_call_ids() {
        let msgs = vec![
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::function("c1", "echo", "{}")],
            ),
            Message::tool_result("c1", "ping"),
        ];
        let wire = convert_messages(&msgs);
        assert_eq!(wire[0]["tool_calls"][0]["id"], "c1");
        assert_eq!(wire[1]["tool_call_id"], "c1");
        assert_eq!(wire[1]["role"], "tool");
    }

    #[test]
    fn stream_chunk_maps_tool_call_fragments() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"echo","arguments":"{\"t"}}]},"finish_reason":null}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        let frames = chunk.into_frames();
        match &frames[0] {
            DeltaFrame::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                assert_eq!(*index, 0);
                assert_eq!(id.as_deref(), Some("c1"));
                assert_eq!(name.as_deref(), Some("echo"));
                assert_eq!(arguments.as_deref(), Some("{\"t"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn finish_reason_becomes_done_frame() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        let frames = chunk.into_frames();
        assert!(matches!(
            &frames[0],
            DeltaFrame::Done { finish_reason: Some(r) } if r == "stop"
        ));
    }
}
