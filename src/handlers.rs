// Health endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub app: String,
    pub uptime_seconds: u64,
    pub local_backends: usize,
    pub sessions: usize,
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.is_ready() { "ok" } else { "starting" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        app: env!("CARGO_PKG_NAME").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        local_backends: state.processes.live_count().await,
        sessions: state.sessions.len().await,
    })
}

/// GET /api/health/ready: lightweight readiness check (no locks).
pub async fn readiness(State(state): State<AppState>) -> Response {
    let ready = state.is_ready();
    let body = json!({ "ready": ready, "uptime_seconds": state.start_time.elapsed().as_secs() });

    if ready {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}
