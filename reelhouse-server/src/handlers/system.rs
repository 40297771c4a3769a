use axum::{extract::State, response::Json};
use serde_json::{Value, json};

use reelhouse_core::QueueLoad;

use crate::{
    api::{ApiResponse, CapabilitiesResponse},
    infra::app_state::AppState,
};

pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let load = state.scheduler().load();
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "queue": {
            "running": load.running,
            "pending": load.pending_interactive + load.pending_idle,
        },
    }))
}

pub async fn capabilities_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<CapabilitiesResponse>> {
    let capabilities = state.scheduler().capabilities();
    Json(ApiResponse::success(CapabilitiesResponse {
        kinds: capabilities.kinds(),
        enabled: capabilities.enabled_kinds(),
        tools: capabilities.tools().clone(),
        transcribe_model: capabilities.transcribe_model().cloned(),
    }))
}

pub async fn queue_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<QueueLoad>> {
    Json(ApiResponse::success(state.scheduler().load()))
}
