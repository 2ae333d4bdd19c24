//! End-to-end tests for the HTTP surface.
//!
//! A scripted backend stands in for the inference server; the gateway runs
//! on an ephemeral port and is driven with a real HTTP client through
//! request validation, the tool loop, streaming, and the listing endpoints.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use docgate::api;
use docgate::config::AppConfig;
use docgate::events::DeltaFrame;
use docgate::llm::orchestrator::Orchestrator;
use docgate::llm::{
    AssistantTurn, BackendError, CallOptions, ChatBackend, DeltaStream, HealthReport, Message,
    ToolCall,
};
use docgate::prompt::SystemPromptCache;
use docgate::tools::{Tool, ToolDescriptor, ToolRegistry};
use docgate::AppState;

struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<AssistantTurn, BackendError>>>,
    calls: Mutex<usize>,
}

impl ScriptedBackend {
    fn new(responses: Vec<Result<AssistantTurn, BackendError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(0),
        })
    }

    fn text(content: &str) -> Result<AssistantTurn, BackendError> {
        Ok(AssistantTurn {
            content: content.to_string(),
            tool_calls: Vec::new(),
        })
    }

    fn tool_call(id: &str, name: &str, args: Value) -> Result<AssistantTurn, BackendError> {
        Ok(AssistantTurn {
            content: String::new(),
            tool_calls: vec![ToolCall::function(id, name, args.to_string())],
        })
    }

    fn pop(&self) -> Result<AssistantTurn, BackendError> {
        *self.calls.lock() += 1;
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Self::text("(script exhausted)"))
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn chat(
        &self,
        _messages: &[Message],
        _tools: &[Value],
        _opts: &CallOptions,
    ) -> Result<AssistantTurn, BackendError> {
        self.pop()
    }

    async fn chat_stream(
        &self,
        _messages: &[Message],
        _tools: &[Value],
        _opts: &CallOptions,
    ) -> Result<DeltaStream, BackendError> {
        let turn = self.pop()?;
        let stream = async_stream::stream! {
            if !turn.content.is_empty() {
                yield Ok(DeltaFrame::content(turn.content.clone()));
            }
            for (index, call) in turn.tool_calls.iter().enumerate() {
                yield Ok(DeltaFrame::ToolCallDelta {
                    index,
                    id: Some(call.id.clone()),
                    name: Some(call.function.name.clone()),
                    arguments: Some(call.function.arguments.clone()),
                });
            }
            yield Ok(DeltaFrame::done());
        };
        Ok(Box::pin(stream))
    }

    async fn health(&self) -> Result<HealthReport, BackendError> {
        Ok(HealthReport {
            message: "scripted backend healthy".into(),
            models: vec!["scripted".into()],
        })
    }

    fn default_model(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "echo",
            "Echo the input back.",
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        )
    }

    async fn execute(&self, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        Ok(args["text"].as_str().unwrap_or_default().to_string())
    }
}

/// Boot a gateway on an ephemeral port over the scripted backend.
async fn serve(backend: Arc<ScriptedBackend>) -> String {
    let config = AppConfig::default();
    let registry = ToolRegistry::new(config.tools.max_tool_result_chars);
    registry.register(Arc::new(EchoTool));

    let prompt = Arc::new(SystemPromptCache::new(
        std::path::PathBuf::from("/nonexistent/prompt.md"),
        config.tools.default_system_prompt.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        backend,
        Arc::new(registry),
        config.tools.clone(),
        prompt,
        None,
    ));

    let state = AppState {
        config: Arc::new(config),
        orchestrator,
        index: None,
        signals: docgate::rag::BackgroundSignals::new(),
    };
    let app = api::create_router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn pure_text_round_trip() {
    let backend = ScriptedBackend::new(vec![ScriptedBackend::text("hello")]);
    let base = serve(backend.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({ "messages": [{"role": "user", "content": "Say hi."}], "stream": false }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(*backend.calls.lock(), 1);
}

#[tokio::test]
async fn tool_loop_round_trip() {
    let backend = ScriptedBackend::new(vec![
        ScriptedBackend::tool_call("c1", "echo", json!({"text": "ping"})),
        ScriptedBackend::text("pong: ping"),
    ]);
    let base = serve(backend.clone()).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({ "messages": [{"role": "user", "content": "echo ping"}] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["choices"][0]["message"]["content"], "pong: ping");
    assert_eq!(*backend.calls.lock(), 2);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let backend = ScriptedBackend::new(vec![]);
    let base = serve(backend).await;
    let client = reqwest::Client::new();

    // Not JSON at all.
    let response = client
        .post(format!("{base}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    // Missing messages.
    let response = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({ "stream": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Non-array messages.
    let response = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({ "messages": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Empty messages.
    let response = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({ "messages": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Negative temperature.
    let response = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": -1.0
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn streaming_emits_chunks_and_done_sentinel() {
    let backend = ScriptedBackend::new(vec![ScriptedBackend::text("streamed answer")]);
    let base = serve(backend).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = response.text().await.unwrap();
    let mut content = String::new();
    let mut saw_done = false;
    let mut saw_finish = false;
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data.trim() == "[DONE]" {
            saw_done = true;
            continue;
        }
        let chunk: Value = serde_json::from_str(data).unwrap();
        assert_eq!(chunk["object"], "chat.completion.chunk");
        if let Some(text) = chunk["choices"][0]["delta"]["content"].as_str() {
            content.push_str(text);
        }
        if chunk["choices"][0]["finish_reason"] == "stop" {
            saw_finish = true;
        }
    }
    assert_eq!(content, "streamed answer");
    assert!(saw_finish, "terminal chunk with finish_reason=stop missing");
    assert!(saw_done, "[DONE] sentinel missing");
}

#[tokio::test]
async fn backend_outage_becomes_a_synthesized_completion() {
    let backend = ScriptedBackend::new(vec![Err(BackendError::Unavailable {
        endpoint: "http://localhost:1234/v1".into(),
        reason: "connection refused".into(),
    })]);
    let base = serve(backend).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({ "messages": [{"role": "user", "content": "hi"}] }))
        .send()
        .await
        .unwrap();
    // An OpenAI-style caller expects a completion, not a 5xx.
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(content.contains("Could not connect"));
    assert_eq!(body["choices"][0]["finish_reason"], "error");
}

#[tokio::test]
async fn health_and_models_endpoints() {
    let backend = ScriptedBackend::new(vec![]);
    let base = serve(backend).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let models: Value = client
        .get(format!("{base}/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["object"], "list");
    assert_eq!(models["data"][0]["id"], "docgate/default");
    assert_eq!(models["data"][0]["object"], "model");
}
