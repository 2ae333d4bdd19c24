//! Liveness and model-listing endpoints.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::json;

use crate::AppState;

/// Create the health/models router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/models", get(list_models))
}

/// Liveness: probes the configured backend. 503 with the probe's
/// diagnostic when the backend is absent or has no model loaded.
async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match state.orchestrator.backend().health().await {
        Ok(report) => Ok(Json(json!({
            "status": "ok",
            "backend": state.config.backend.backend_type.to_string(),
            "model": state.config.backend.served_model_name,
            "detail": report.message,
        }))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "detail": e.to_string(),
            })),
        )),
    }
}

/// The single configured model.
async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "object": "list",
        "data": [
            {
                "id": state.config.backend.served_model_name,
                "object": "model",
                "created": chrono::Utc::now().timestamp(),
                "owned_by": "docgate",
                "root": state.config.backend.served_model_name,
                "parent": null,
            }
        ],
    }))
}
