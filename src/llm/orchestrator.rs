//! The tool-calling orchestrator.
//!
//! A single-task per-request loop bounded by an iteration budget and a
//! wall-clock budget: call the backend with the running message list,
//! append the assistant turn verbatim, dispatch any tool calls in order,
//! splice their results back in, and repeat until the backend answers in
//! plain text. On budget exhaustion one final-synthesis call (tools off)
//! forces a natural-language answer; raw tool output is never surfaced.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use once_cell::sync::OnceCell;

use crate::config::ToolLoopSettings;
use crate::events::{DeltaFrame, StreamReducer};
use crate::llm::{BackendError, CallOptions, ChatBackend, Message, ToolChoice};
use crate::prompt::SystemPromptCache;
use crate::rag::BackgroundSignals;
use crate::tools::ToolRegistry;

/// Marker some reasoning models emit before their user-facing answer.
/// Tokens before the marker are suppressed in streaming mode.
pub const FINAL_RESPONSE_MARKER: &str = "[BEGIN FINAL RESPONSE]";

/// Signature substrings of internal role/channel markers leaking into
/// output text.
const MALFORMED_SIGNATURES: &[&str] = &["<|start|>", "<|channel|>", "<|message|>", "<|end|>"];

/// Nudge appended when `tool_choice=required` produced no tool calls.
const NUDGE_MESSAGE: &str =
    "You must use one of the available tools to answer this request. Call the \
     appropriate tool now instead of answering directly.";

/// Stern instruction prepended when the final answer carried internal
/// markers.
const CLEAN_OUTPUT_INSTRUCTION: &str =
    "Your previous reply contained internal formatting tokens. Respond again \
     with only the plain-text answer, without any special tokens or channel \
     markers.";

/// Fallback when the cleaned retry still carries markers.
const MALFORMED_FALLBACK: &str =
    "I generated an invalid response. Please try asking your question again.";

/// Apology when final synthesis itself fails.
const SYNTHESIS_APOLOGY: &str =
    "I apologize, but I've reached the maximum number of tool calling iterations \
     and could not produce a final answer.";

/// One chat turn handed to the orchestrator by the request surface.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    /// Conversation messages (validated, non-empty).
    pub messages: Vec<Message>,
    /// Temperature override.
    pub temperature: Option<f32>,
    /// Tool-choice override for the first iteration.
    pub tool_choice: Option<ToolChoice>,
    /// Per-request model override. Scoped to this request's backend calls
    /// only; nothing shared is mutated, so there is nothing to restore.
    pub model_override: Option<String>,
}

/// Final result of one orchestrated turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Final assistant text.
    pub content: String,
    /// OpenAI-style finish reason: "stop", "length", or "error".
    pub finish_reason: &'static str,
    /// Number of backend calls made.
    pub backend_calls: usize,
}

/// A piece of a streamed turn.
#[derive(Debug, Clone)]
pub enum StreamPart {
    /// Content delta to forward to the caller.
    Content(String),
    /// Terminal marker with the finish reason.
    Done(&'static str),
}

/// Incremental filter for the final-response marker protocol.
///
/// Content is held while it may still precede a marker (the marker is found
/// by substring search over the accumulating buffer, so one split across
/// frames is still caught). Once the full marker is observed the filter
/// turns transparent and later pushes pass through unchanged, so
/// post-marker tokens forward live. A stream that never emits the marker
/// flushes whole via [`MarkerFilter::finish`]; no content is lost.
#[derive(Debug, Default)]
pub struct MarkerFilter {
    buffer: String,
    passthrough: bool,
}

impl MarkerFilter {
    /// Feed a content delta; returns text that may be forwarded now.
    pub fn push(&mut self, text: &str) -> Option<String> {
        if self.passthrough {
            return Some(text.to_string());
        }
        self.buffer.push_str(text);
        let pos = self.buffer.find(FINAL_RESPONSE_MARKER)?;
        self.passthrough = true;
        let after = self.buffer[pos + FINAL_RESPONSE_MARKER.len()..]
            .trim_start()
            .to_string();
        self.buffer.clear();
        if after.is_empty() {
            None
        } else {
            Some(after)
        }
    }

    /// Whether the marker has been observed.
    pub fn saw_marker(&self) -> bool {
        self.passthrough
    }

    /// Flush the held content at stream end when no marker appeared.
    pub fn finish(self) -> Option<String> {
        if self.passthrough || self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer)
        }
    }
}

/// What kind of backend call the streaming loop is making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    /// A normal tool-loop iteration.
    Loop,
    /// The terminal synthesis call after budget exhaustion.
    Synthesis,
    /// The one retry after malformed terminal output.
    CleanRetry,
}

/// Synthesized text and finish reason for a failed streaming call.
fn stream_failure(mode: StreamMode, error: &BackendError) -> (String, &'static str) {
    match mode {
        StreamMode::Loop => (describe_backend_error(error), "error"),
        StreamMode::Synthesis => (SYNTHESIS_APOLOGY.to_string(), "length"),
        StreamMode::CleanRetry => (MALFORMED_FALLBACK.to_string(), "stop"),
    }
}

/// The per-request tool loop over one backend and one tool registry.
pub struct Orchestrator {
    backend: Arc<dyn ChatBackend>,
    tools: Arc<ToolRegistry>,
    settings: ToolLoopSettings,
    prompt: Arc<SystemPromptCache>,
    rag_signals: Option<Arc<BackgroundSignals>>,
    // Canonical projected tool list, built once per process.
    schemas: OnceCell<Vec<serde_json::Value>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.backend.name())
            .field("max_iterations", &self.settings.max_iterations)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        tools: Arc<ToolRegistry>,
        settings: ToolLoopSettings,
        prompt: Arc<SystemPromptCache>,
        rag_signals: Option<Arc<BackgroundSignals>>,
    ) -> Self {
        Self {
            backend,
            tools,
            settings,
            prompt,
            rag_signals,
            schemas: OnceCell::new(),
        }
    }

    /// The tool registry.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// The backend driver.
    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    fn tool_schemas(&self) -> &[serde_json::Value] {
        self.schemas.get_or_init(|| self.tools.wire_schemas())
    }

    /// Run one non-streaming turn.
    pub async fn run(&self, request: TurnRequest) -> TurnOutcome {
        self.drive(request).await
    }

    /// Run one streaming turn.
    ///
    /// The same loop as [`Orchestrator::run`], but over the backend's
    /// streaming transport. Frames of the current response pass through a
    /// [`MarkerFilter`] as they arrive: post-marker content forwards live,
    /// markerless content is held exactly until the response's end (the
    /// earliest point at which it is known to be terminal rather than a
    /// tool-calling turn) and flushed whole. Non-terminal iteration
    /// responses are consumed without forwarding.
    pub fn run_streaming(
        self: &Arc<Self>,
        request: TurnRequest,
    ) -> impl futures::Stream<Item = StreamPart> + Send + 'static {
        let orch = Arc::clone(self);

        async_stream::stream! {
            // Advisory: background index work yields for the duration of
            // the request.
            let _pause = orch.rag_signals.as_ref().map(|s| s.pause_guard());

            let started = Instant::now();
            let deadline = match orch.settings.tool_loop_timeout_secs {
                0 => None,
                secs => Some(started + Duration::from_secs(secs)),
            };

            let mut messages = Vec::with_capacity(request.messages.len() + 1);
            messages.push(Message::system(orch.prompt.get()));
            messages.extend(request.messages);

            let temperature = request
                .temperature
                .unwrap_or(orch.settings.default_temperature);
            let schemas = orch.tool_schemas().to_vec();
            let first_choice = request
                .tool_choice
                .unwrap_or(orch.settings.first_iteration_tool_choice);

            let mut nudge_available = true;
            let mut iteration = 0usize;
            let mut mode = StreamMode::Loop;

            loop {
                if mode == StreamMode::Loop
                    && (iteration >= orch.settings.max_iterations || past(deadline))
                {
                    tracing::debug!("Budget exhausted, streaming final synthesis");
                    mode = StreamMode::Synthesis;
                }
                let in_loop = mode == StreamMode::Loop;

                let (tools, choice): (&[serde_json::Value], ToolChoice) =
                    if !in_loop || schemas.is_empty() {
                        (&[], ToolChoice::None)
                    } else if iteration == 0 {
                        (&schemas, first_choice)
                    } else {
                        (&schemas, ToolChoice::Auto)
                    };
                let opts = CallOptions {
                    temperature,
                    tool_choice: choice,
                    model_override: request.model_override.clone(),
                };

                let mut frames = match orch.backend.chat_stream(&messages, tools, &opts).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let (text, reason) = stream_failure(mode, &e);
                        yield StreamPart::Content(text);
                        yield StreamPart::Done(reason);
                        return;
                    }
                };

                // Consume the response, forwarding filtered content as it
                // arrives. A tool-call delta proves the response is not
                // terminal; content forwarding stops there.
                let mut reducer = StreamReducer::new();
                let mut filter = MarkerFilter::default();
                let mut forwarded = false;
                let mut stream_error: Option<BackendError> = None;

                while let Some(frame) = frames.next().await {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            stream_error = Some(e);
                            break;
                        }
                    };
                    match &frame {
                        DeltaFrame::Content { text } => {
                            if !reducer.has_tool_calls() {
                                if let Some(out) = filter.push(text) {
                                    forwarded = true;
                                    yield StreamPart::Content(out);
                                }
                            }
                        }
                        DeltaFrame::ToolCallDelta { .. } if filter.saw_marker() => {
                            // Forwarded post-marker text cannot be
                            // retracted.
                            tracing::warn!(
                                "Tool calls arrived after the final-response marker"
                            );
                        }
                        _ => {}
                    }
                    reducer.apply(frame);
                }

                if let Some(e) = stream_error {
                    tracing::warn!(error = %e, "Backend stream failed mid-response");
                    let (text, reason) = stream_failure(mode, &e);
                    if !forwarded {
                        yield StreamPart::Content(text);
                    }
                    yield StreamPart::Done(reason);
                    return;
                }

                let (content, tool_calls) = reducer.finish();

                if in_loop && !tool_calls.is_empty() {
                    // Append the assistant message verbatim, tool calls
                    // included, so the next backend call sees consistent
                    // history.
                    messages.push(Message::assistant_with_tool_calls(
                        content.clone(),
                        tool_calls.clone(),
                    ));

                    let mut timed_out = false;
                    for call in &tool_calls {
                        if timed_out || past(deadline) {
                            timed_out = true;
                            messages.push(Message::tool_result(
                                call.id.clone(),
                                "Error: tool loop timeout reached before this call was dispatched",
                            ));
                            continue;
                        }
                        let result = orch
                            .tools
                            .dispatch(&call.function.name, &call.function.arguments)
                            .await;
                        messages.push(Message::tool_result(call.id.clone(), result));
                    }
                    iteration += 1;
                    continue;
                }

                if in_loop && choice == ToolChoice::Required && nudge_available {
                    nudge_available = false;
                    messages.push(Message::assistant(content));
                    messages.push(Message::user(NUDGE_MESSAGE));
                    tracing::debug!("tool_choice=required returned no tool calls, nudging once");
                    continue;
                }

                // Terminal answer.
                messages.push(Message::assistant(content.clone()));

                if forwarded {
                    if is_malformed(&content) {
                        tracing::warn!(
                            "Forwarded output contained internal markers; cannot retract"
                        );
                    }
                    yield StreamPart::Done("stop");
                    return;
                }

                if is_malformed(&content) {
                    if mode != StreamMode::CleanRetry {
                        tracing::warn!(
                            "Model output contained internal markers, retrying once"
                        );
                        messages.push(Message::user(CLEAN_OUTPUT_INSTRUCTION));
                        mode = StreamMode::CleanRetry;
                        continue;
                    }
                    yield StreamPart::Content(MALFORMED_FALLBACK.to_string());
                    yield StreamPart::Done("stop");
                    return;
                }

                if let Some(rest) = filter.finish() {
                    yield StreamPart::Content(rest);
                }
                yield StreamPart::Done("stop");
                return;
            }
        }
    }

    /// The non-streaming loop.
    async fn drive(&self, request: TurnRequest) -> TurnOutcome {
        // Advisory: background index work yields for the duration of the
        // request. The drop of this guard resumes it.
        let _pause = self.rag_signals.as_ref().map(|s| s.pause_guard());

        let started = Instant::now();
        let deadline = match self.settings.tool_loop_timeout_secs {
            0 => None,
            secs => Some(started + Duration::from_secs(secs)),
        };

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(Message::system(self.prompt.get()));
        messages.extend(request.messages);

        let temperature = request
            .temperature
            .unwrap_or(self.settings.default_temperature);
        let schemas = self.tool_schemas().to_vec();
        let first_choice = request
            .tool_choice
            .unwrap_or(self.settings.first_iteration_tool_choice);

        let mut backend_calls = 0usize;
        let mut nudge_available = true;
        let mut iteration = 0usize;

        loop {
            if iteration >= self.settings.max_iterations || past(deadline) {
                return self
                    .final_synthesis(messages, temperature, &request.model_override, backend_calls)
                    .await;
            }

            let choice = if schemas.is_empty() {
                // No tools to offer; the wire still carries an explicit
                // tool_choice.
                ToolChoice::None
            } else if iteration == 0 {
                first_choice
            } else {
                ToolChoice::Auto
            };
            let opts = CallOptions {
                temperature,
                tool_choice: choice,
                model_override: request.model_override.clone(),
            };

            let turn = match self.backend.chat(&messages, &schemas, &opts).await {
                Ok(turn) => turn,
                Err(e) => {
                    return TurnOutcome {
                        content: describe_backend_error(&e),
                        finish_reason: "error",
                        backend_calls,
                    }
                }
            };
            backend_calls += 1;

            if turn.tool_calls.is_empty() {
                if choice == ToolChoice::Required && nudge_available {
                    // One retry of the current iteration; it consumes wall
                    // clock but no iteration slot.
                    nudge_available = false;
                    messages.push(Message::assistant(turn.content));
                    messages.push(Message::user(NUDGE_MESSAGE));
                    tracing::debug!("tool_choice=required returned no tool calls, nudging once");
                    continue;
                }
                messages.push(Message::assistant(turn.content.clone()));
                return self
                    .ensure_clean_output(
                        turn.content,
                        messages,
                        temperature,
                        &request.model_override,
                        backend_calls,
                    )
                    .await;
            }

            // Append the assistant message verbatim, tool calls included,
            // so the next backend call sees consistent history.
            messages.push(Message::assistant_with_tool_calls(
                turn.content.clone(),
                turn.tool_calls.clone(),
            ));

            let mut timed_out = false;
            for call in &turn.tool_calls {
                if timed_out || past(deadline) {
                    // Dispatch aborts between calls; the remaining ids
                    // still get result messages so the history stays
                    // consistent.
                    timed_out = true;
                    messages.push(Message::tool_result(
                        call.id.clone(),
                        "Error: tool loop timeout reached before this call was dispatched",
                    ));
                    continue;
                }
                let result = self
                    .tools
                    .dispatch(&call.function.name, &call.function.arguments)
                    .await;
                messages.push(Message::tool_result(call.id.clone(), result));
            }

            iteration += 1;
        }
    }

    /// One terminal call with tools disabled, forcing a natural-language
    /// answer from the gathered tool results.
    async fn final_synthesis(
        &self,
        mut messages: Vec<Message>,
        temperature: f32,
        model_override: &Option<String>,
        mut backend_calls: usize,
    ) -> TurnOutcome {
        tracing::debug!(backend_calls, "Budget exhausted, running final synthesis");
        let opts = CallOptions {
            temperature,
            tool_choice: ToolChoice::None,
            model_override: model_override.clone(),
        };

        let turn = match self.backend.chat(&messages, &[], &opts).await {
            Ok(turn) => turn,
            Err(e) => {
                tracing::warn!(error = %e, "Final synthesis failed");
                return TurnOutcome {
                    content: SYNTHESIS_APOLOGY.to_string(),
                    finish_reason: "length",
                    backend_calls,
                };
            }
        };
        backend_calls += 1;
        messages.push(Message::assistant(turn.content.clone()));

        self.ensure_clean_output(
            turn.content,
            messages,
            temperature,
            model_override,
            backend_calls,
        )
        .await
    }

    /// Scan a terminal answer for internal-marker leakage; retry once with
    /// a stern instruction, then fall back to a fixed string.
    async fn ensure_clean_output(
        &self,
        content: String,
        mut messages: Vec<Message>,
        temperature: f32,
        model_override: &Option<String>,
        mut backend_calls: usize,
    ) -> TurnOutcome {
        if !is_malformed(&content) {
            return TurnOutcome {
                content,
                finish_reason: "stop",
                backend_calls,
            };
        }

        tracing::warn!("Model output contained internal markers, retrying once");
        messages.push(Message::user(CLEAN_OUTPUT_INSTRUCTION));
        let opts = CallOptions {
            temperature,
            tool_choice: ToolChoice::None,
            model_override: model_override.clone(),
        };

        match self.backend.chat(&messages, &[], &opts).await {
            Ok(turn) => {
                backend_calls += 1;
                if is_malformed(&turn.content) {
                    tracing::warn!("Retry still malformed, returning fallback text");
                    TurnOutcome {
                        content: MALFORMED_FALLBACK.to_string(),
                        finish_reason: "stop",
                        backend_calls,
                    }
                } else {
                    TurnOutcome {
                        content: turn.content,
                        finish_reason: "stop",
                        backend_calls,
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed-output retry failed");
                TurnOutcome {
                    content: MALFORMED_FALLBACK.to_string(),
                    finish_reason: "stop",
                    backend_calls,
                }
            }
        }
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn is_malformed(content: &str) -> bool {
    MALFORMED_SIGNATURES.iter().any(|sig| content.contains(sig))
}

/// Synthesized-completion text for unrecoverable backend conditions. The
/// caller is an OpenAI-style client expecting a completion, not an HTTP
/// error.
pub fn describe_backend_error(error: &BackendError) -> String {
    match error {
        BackendError::Unavailable { endpoint, .. } => format!(
            "Error: Could not connect to the backend at {endpoint}. Please ensure the \
             backend is running."
        ),
        BackendError::Timeout { seconds } => format!(
            "Error: Backend request timed out after {seconds}s. The model may be \
             overloaded or unresponsive."
        ),
        BackendError::Http { status, .. } => {
            format!("Error: The backend returned HTTP {status}.")
        }
        BackendError::Protocol { .. } => {
            "Error: The backend returned an unreadable response.".to_string()
        }
        BackendError::NoModelLoaded { endpoint } => format!(
            "Error: The backend at {endpoint} is running but has no model loaded."
        ),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedBackend;
    use super::*;
    use crate::llm::MessageRole;
    use crate::tools::{Tool, ToolDescriptor};
    use async_trait::async_trait;
    use futures::StreamExt;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new(
                "echo",
                "Echo the input back.",
                serde_json::json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
            )
        }

        async fn execute(&self, arguments: &str) -> anyhow::Result<String> {
            let args: serde_json::Value = serde_json::from_str(arguments)?;
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn registry_with_echo() -> Arc<ToolRegistry> {
        let registry = ToolRegistry::new(10_000);
        registry.register(Arc::new(EchoTool));
        Arc::new(registry)
    }

    fn orchestrator(
        backend: Arc<ScriptedBackend>,
        tools: Arc<ToolRegistry>,
        settings: ToolLoopSettings,
    ) -> Orchestrator {
        let prompt = Arc::new(SystemPromptCache::new(
            std::path::PathBuf::from("/nonexistent/prompt.md"),
            "You are a helpful AI assistant.",
        ));
        Orchestrator::new(backend, tools, settings, prompt, None)
    }

    fn request(text: &str) -> TurnRequest {
        TurnRequest {
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pure_text_answer_takes_one_call() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::text("hello")]);
        let orch = orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        );

        let outcome = orch.run(request("Say hi.")).await;
        assert_eq!(outcome.content, "hello");
        assert_eq!(outcome.finish_reason, "stop");
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn single_tool_call_round_trip() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::tool_call("c1", "echo", serde_json::json!({"text": "ping"})),
            ScriptedBackend::text("pong: ping"),
        ]);
        let orch = orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        );

        let outcome = orch.run(request("echo ping")).await;
        assert_eq!(outcome.content, "pong: ping");
        assert_eq!(backend.call_count(), 2);

        // The second call's history: system, user, assistant(tool_calls),
        // tool(c1, "ping").
        let calls = backend.calls.lock();
        let history = &calls[1].messages;
        let tool_msg = history
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_msg.content, "ping");
        let assistant = history
            .iter()
            .find(|m| m.tool_calls.is_some())
            .unwrap();
        assert_eq!(assistant.tool_calls.as_ref().unwrap()[0].id, "c1");
    }

    #[tokio::test]
    async fn tool_call_correspondence_holds() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::tool_call("c1", "echo", serde_json::json!({"text": "a"})),
            ScriptedBackend::tool_call("c2", "echo", serde_json::json!({"text": "b"})),
            ScriptedBackend::text("done"),
        ]);
        let orch = orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        );
        orch.run(request("go")).await;

        let calls = backend.calls.lock();
        let history = &calls.last().unwrap().messages;
        for (i, message) in history.iter().enumerate() {
            if message.role == MessageRole::Tool {
                let call_id = message.tool_call_id.as_deref().unwrap();
                let preceding_assistant = history[..i]
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::Assistant && m.tool_calls.is_some())
                    .unwrap();
                assert!(preceding_assistant
                    .tool_calls
                    .as_ref()
                    .unwrap()
                    .iter()
                    .any(|c| c.id == call_id));
            }
        }
    }

    #[tokio::test]
    async fn required_with_no_tool_use_nudges_once() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::text("sure"),
            ScriptedBackend::tool_call("c1", "echo", serde_json::json!({"text": "ok"})),
            ScriptedBackend::text("done"),
        ]);
        let orch = orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        );

        let mut req = request("go");
        req.tool_choice = Some(ToolChoice::Required);
        let outcome = orch.run(req).await;

        assert_eq!(outcome.content, "done");
        assert_eq!(backend.call_count(), 3);
        // The nudge user-message appears in the retry call's history.
        let calls = backend.calls.lock();
        assert!(calls[1]
            .messages
            .iter()
            .any(|m| m.role == MessageRole::User && m.content.contains("must use")));
        // The nudge retry keeps tool_choice=required (same iteration).
        assert_eq!(calls[1].tool_choice, ToolChoice::Required);
    }

    #[tokio::test]
    async fn iteration_exhaustion_triggers_final_synthesis() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::tool_call("c1", "echo", serde_json::json!({"text": "1"})),
            ScriptedBackend::tool_call("c2", "echo", serde_json::json!({"text": "2"})),
            ScriptedBackend::text("summary"),
        ]);
        let settings = ToolLoopSettings {
            max_iterations: 2,
            ..Default::default()
        };
        let orch = orchestrator(backend.clone(), registry_with_echo(), settings);

        let outcome = orch.run(request("loop")).await;
        assert_eq!(outcome.content, "summary");
        assert_eq!(backend.call_count(), 3);

        // The synthesis call offers no tools and tool_choice=none.
        let calls = backend.calls.lock();
        let synthesis = calls.last().unwrap();
        assert_eq!(synthesis.tools_offered, 0);
        assert_eq!(synthesis.tool_choice, ToolChoice::None);
    }

    #[tokio::test]
    async fn malformed_final_output_is_retried_once() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::tool_call("c1", "echo", serde_json::json!({"text": "x"})),
            ScriptedBackend::text("<|start|>assistant<|channel|>garbled"),
            ScriptedBackend::text("clean answer"),
        ]);
        let settings = ToolLoopSettings {
            max_iterations: 1,
            ..Default::default()
        };
        let orch = orchestrator(backend.clone(), registry_with_echo(), settings);

        let outcome = orch.run(request("go")).await;
        assert_eq!(outcome.content, "clean answer");
        // tool iteration + synthesis + clean retry
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn persistently_malformed_output_falls_back() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::text("<|channel|>one"),
            ScriptedBackend::text("<|channel|>two"),
        ]);
        let orch = orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        );

        let outcome = orch.run(request("hi")).await;
        assert_eq!(outcome.content, MALFORMED_FALLBACK);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn backend_error_becomes_synthesized_content() {
        let backend = ScriptedBackend::new(vec![Err(BackendError::Unavailable {
            endpoint: "http://localhost:1234/v1".into(),
            reason: "connection refused".into(),
        })]);
        let orch = orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        );

        let outcome = orch.run(request("hi")).await;
        assert_eq!(outcome.finish_reason, "error");
        assert!(outcome.content.contains("Could not connect"));
    }

    #[tokio::test]
    async fn synthesis_failure_returns_apology() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::tool_call("c1", "echo", serde_json::json!({"text": "x"})),
            Err(BackendError::Timeout { seconds: 300 }),
        ]);
        let settings = ToolLoopSettings {
            max_iterations: 1,
            ..Default::default()
        };
        let orch = orchestrator(backend.clone(), registry_with_echo(), settings);

        let outcome = orch.run(request("go")).await;
        assert_eq!(outcome.content, SYNTHESIS_APOLOGY);
        assert_eq!(outcome.finish_reason, "length");
    }

    #[tokio::test]
    async fn wall_clock_exhaustion_goes_to_synthesis() {
        struct SlowTool;

        #[async_trait]
        impl Tool for SlowTool {
            fn descriptor(&self) -> ToolDescriptor {
                ToolDescriptor::new("slow", "sleeps", serde_json::json!({"type": "object"}))
            }
            async fn execute(&self, _arguments: &str) -> anyhow::Result<String> {
                tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
                Ok("slept".to_string())
            }
        }

        let registry = ToolRegistry::new(10_000);
        registry.register(Arc::new(SlowTool));
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::tool_call("c1", "slow", serde_json::json!({})),
            ScriptedBackend::text("synthesized"),
        ]);
        let settings = ToolLoopSettings {
            max_iterations: 10,
            tool_loop_timeout_secs: 1,
            ..Default::default()
        };
        let orch = orchestrator(backend.clone(), Arc::new(registry), settings);

        let outcome = orch.run(request("go")).await;
        // After the slow tool, the deadline is past: no second iteration,
        // straight to synthesis.
        assert_eq!(outcome.content, "synthesized");
        assert_eq!(backend.call_count(), 2);
        let calls = backend.calls.lock();
        assert_eq!(calls.last().unwrap().tool_choice, ToolChoice::None);
    }

    #[tokio::test]
    async fn model_override_scopes_to_the_request() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::text("first"),
            ScriptedBackend::text("second"),
        ]);
        let orch = orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        );

        let mut req = request("hi");
        req.model_override = Some("special-model".to_string());
        orch.run(req).await;
        orch.run(request("hi again")).await;

        let calls = backend.calls.lock();
        assert_eq!(calls[0].model.as_deref(), Some("special-model"));
        assert_eq!(calls[1].model, None);
    }

    #[tokio::test]
    async fn no_tools_registered_sends_tool_choice_none() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::text("hi")]);
        let orch = orchestrator(
            backend.clone(),
            Arc::new(ToolRegistry::new(10_000)),
            ToolLoopSettings::default(),
        );
        orch.run(request("hello")).await;

        let calls = backend.calls.lock();
        assert_eq!(calls[0].tool_choice, ToolChoice::None);
        assert_eq!(calls[0].tools_offered, 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_surfaced_as_tool_error_message() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::tool_call("c1", "missing_tool", serde_json::json!({})),
            ScriptedBackend::text("recovered"),
        ]);
        let orch = orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        );

        let outcome = orch.run(request("go")).await;
        assert_eq!(outcome.content, "recovered");
        let calls = backend.calls.lock();
        let tool_msg = calls[1]
            .messages
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .unwrap();
        assert_eq!(tool_msg.content, "Error: tool missing_tool not registered");
    }

    fn collected_content(parts: &[StreamPart]) -> String {
        parts
            .iter()
            .filter_map(|p| match p {
                StreamPart::Content(text) => Some(text.clone()),
                StreamPart::Done(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn streaming_forwards_only_the_final_answer() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::tool_call("c1", "echo", serde_json::json!({"text": "ping"})),
            ScriptedBackend::text("pong: ping"),
        ]);
        let orch = Arc::new(orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        ));

        let parts: Vec<StreamPart> = orch.run_streaming(request("echo ping")).collect().await;

        assert_eq!(collected_content(&parts), "pong: ping");
        assert!(matches!(parts.last(), Some(StreamPart::Done("stop"))));
        // Two backend calls through the streaming transport.
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn thinker_marker_suppresses_preamble() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::text(
            "thinking out loud here [BEGIN FINAL RESPONSE] the real answer",
        )]);
        let orch = Arc::new(orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        ));

        let parts: Vec<StreamPart> = orch.run_streaming(request("hi")).collect().await;
        assert_eq!(collected_content(&parts), "the real answer");
    }

    #[tokio::test]
    async fn post_marker_frames_forward_live() {
        // The marker arrives in the first frame; the scripted backend
        // splits content into two frames, so the second half must surface
        // as its own part rather than one end-of-stream flush.
        let backend = ScriptedBackend::new(vec![ScriptedBackend::text(
            "[BEGIN FINAL RESPONSE] first half of the answer and then the second half arrives",
        )]);
        let orch = Arc::new(orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        ));

        let parts: Vec<StreamPart> = orch.run_streaming(request("hi")).collect().await;
        let content_parts = parts
            .iter()
            .filter(|p| matches!(p, StreamPart::Content(_)))
            .count();
        assert!(content_parts >= 2, "expected live per-frame parts, got {parts:?}");
        assert_eq!(
            collected_content(&parts),
            "first half of the answer and then the second half arrives"
        );
    }

    #[tokio::test]
    async fn missing_marker_flushes_everything() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::text("plain answer")]);
        let orch = Arc::new(orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        ));

        let parts: Vec<StreamPart> = orch.run_streaming(request("hi")).collect().await;
        assert_eq!(collected_content(&parts), "plain answer");
    }

    #[tokio::test]
    async fn streaming_synthesis_runs_after_exhaustion() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::tool_call("c1", "echo", serde_json::json!({"text": "1"})),
            ScriptedBackend::tool_call("c2", "echo", serde_json::json!({"text": "2"})),
            ScriptedBackend::text("summary"),
        ]);
        let settings = ToolLoopSettings {
            max_iterations: 2,
            ..Default::default()
        };
        let orch = Arc::new(orchestrator(backend.clone(), registry_with_echo(), settings));

        let parts: Vec<StreamPart> = orch.run_streaming(request("loop")).collect().await;
        assert_eq!(collected_content(&parts), "summary");
        assert_eq!(backend.call_count(), 3);

        let calls = backend.calls.lock();
        let synthesis = calls.last().unwrap();
        assert_eq!(synthesis.tools_offered, 0);
        assert_eq!(synthesis.tool_choice, ToolChoice::None);
    }

    #[tokio::test]
    async fn streaming_malformed_output_is_retried_once() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::text("<|start|>assistant<|channel|>garbled"),
            ScriptedBackend::text("clean answer"),
        ]);
        let orch = Arc::new(orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        ));

        let parts: Vec<StreamPart> = orch.run_streaming(request("hi")).collect().await;
        assert_eq!(collected_content(&parts), "clean answer");
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn streaming_backend_error_yields_synthesized_content() {
        let backend = ScriptedBackend::new(vec![Err(BackendError::Unavailable {
            endpoint: "http://localhost:1234/v1".into(),
            reason: "connection refused".into(),
        })]);
        let orch = Arc::new(orchestrator(
            backend.clone(),
            registry_with_echo(),
            ToolLoopSettings::default(),
        ));

        let parts: Vec<StreamPart> = orch.run_streaming(request("hi")).collect().await;
        assert!(collected_content(&parts).contains("Could not connect"));
        assert!(matches!(parts.last(), Some(StreamPart::Done("error"))));
    }

    #[test]
    fn marker_filter_holds_until_marker_then_passes_through() {
        let mut filter = MarkerFilter::default();
        assert_eq!(filter.push("reasoning "), None);
        assert_eq!(filter.push("[BEGIN FINAL"), None);
        assert_eq!(filter.push(" RESPONSE] hi").as_deref(), Some("hi"));
        assert!(filter.saw_marker());
        // Live passthrough after the marker.
        assert_eq!(filter.push(" there").as_deref(), Some(" there"));
        assert_eq!(filter.finish(), None);
    }

    #[test]
    fn marker_filter_flushes_whole_stream_without_marker() {
        let mut filter = MarkerFilter::default();
        assert_eq!(filter.push("plain "), None);
        assert_eq!(filter.push("answer"), None);
        assert_eq!(filter.finish().as_deref(), Some("plain answer"));
    }

    #[test]
    fn marker_filter_empty_stream_flushes_nothing() {
        let filter = MarkerFilter::default();
        assert_eq!(filter.finish(), None);
    }
}
