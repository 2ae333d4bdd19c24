//! Backend dialect drivers.
//!
//! Two drivers implement [`ChatBackend`]: [`OpenAiCompatibleBackend`] for
//! OpenAI-style servers and [`NativeBackend`] for the native local-inference
//! protocol. Shared here: the connection-class retry loop, error
//! classification, and the panic-isolated request hook.

mod native;
mod openai;

pub use native::NativeBackend;
pub use openai::OpenAiCompatibleBackend;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendKind, BackendSettings};
use crate::llm::{BackendError, ChatBackend, RequestHook};

/// Create the configured backend driver.
pub fn create_backend(
    settings: BackendSettings,
    hook: Option<RequestHook>,
) -> anyhow::Result<Arc<dyn ChatBackend>> {
    Ok(match settings.backend_type {
        BackendKind::OpenaiCompatible => Arc::new(OpenAiCompatibleBackend::new(settings, hook)?),
        BackendKind::Native => Arc::new(NativeBackend::new(settings, hook)?),
    })
}

/// Build the shared, connection-pooling HTTP client for a backend.
///
/// Two separate budgets: connect (small) and read (large). The read budget
/// covers the whole body, including a streaming one.
pub(crate) fn build_client(settings: &BackendSettings) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout())
        .timeout(settings.read_timeout())
        .build()?)
}

/// Whether an error is connection-class (dial failure, connection reset)
/// and therefore eligible for retry. HTTP statuses and read timeouts are
/// surfaced directly.
pub(crate) fn is_connection_error(err: &reqwest::Error) -> bool {
    if err.is_connect() {
        return true;
    }
    // A reset mid-request surfaces as a hyper transport error; walk the
    // source chain rather than relying on reqwest's classification.
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        let text = inner.to_string();
        if text.contains("connection reset") || text.contains("connection closed") {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Map a transport error into the backend taxonomy.
pub(crate) fn classify_transport_error(
    err: &reqwest::Error,
    settings: &BackendSettings,
) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout {
            seconds: settings.read_timeout_secs,
        }
    } else {
        BackendError::Unavailable {
            endpoint: settings.endpoint.clone(),
            reason: err.to_string(),
        }
    }
}

/// Send a request with bounded exponential retry on connection-class
/// failures only. Delays are `base * 2^k` for `k = 0..attempts-1`.
pub(crate) async fn send_with_retry<F>(
    settings: &BackendSettings,
    mut send: F,
) -> Result<reqwest::Response, BackendError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let attempts = settings.retry_attempts.max(1);
    let mut delay = settings.retry_initial_delay();

    let mut last_err: Option<reqwest::Error> = None;
    for attempt in 0..attempts {
        match send().send().await {
            Ok(response) => return Ok(response),
            Err(err) if is_connection_error(&err) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Backend connection failed, retrying"
                );
                last_err = Some(err);
                if attempt + 1 < attempts {
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
            Err(err) => return Err(classify_transport_error(&err, settings)),
        }
    }

    Err(BackendError::Unavailable {
        endpoint: settings.endpoint.clone(),
        reason: last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "connection failed".to_string()),
    })
}

/// Check the response status, mapping errors with a truncated body for
/// debugging.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body = truncate_for_log(&body, 512);
    Err(BackendError::Http {
        status: status.as_u16(),
        body,
    })
}

/// Invoke the request hook, isolating panics. The hook must never take the
/// adapter down; a panicking hook is logged and ignored.
pub(crate) fn fire_hook(hook: &Option<RequestHook>, backend: &'static str, payload: &serde_json::Value) {
    if let Some(hook) = hook {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            hook(backend, payload);
        }));
        if result.is_err() {
            tracing::warn!(backend = backend, "Request hook panicked; ignoring");
        }
    }
}

/// Truncate a string for log output, respecting char boundaries.
pub(crate) fn truncate_for_log(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… ({} bytes total)", &text[..end], text.len())
}

/// Health-probe timeout helper shared by both drivers.
pub(crate) fn probe_timeout(settings: &BackendSettings) -> Duration {
    Duration::from_secs(settings.health_check_timeout_secs)
}
