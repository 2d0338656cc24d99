//! Protocol Gateway: the public MCP endpoints.
//!
//! Streamable HTTP transport on `/api/mcp/{deployment_id}`:
//! - `GET` opens the server-push event channel.
//! - `POST` submits one JSON-RPC message.
//!
//! Legacy HTTP+SSE transport on `/api/mcp/{deployment_id}/sse` and
//! `/api/mcp/{deployment_id}/messages`, sharing the same dispatch.
//!
//! Every entry point resolves the deployment and checks the caller's bearer
//! token before looking at anything else in the request.

pub mod dispatch;
pub mod stream;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;

use self::dispatch::{CallMeta, Dispatched, Outcome, Rejected};
use crate::auth;
use crate::directory::Deployment;
use crate::error::GatewayError;
use crate::jsonrpc::{self, DEFAULT_PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/mcp/{deployment_id}",
            get(open_event_channel).post(submit_message),
        )
        .route("/api/mcp/{deployment_id}/sse", get(legacy_event_channel))
        .route("/api/mcp/{deployment_id}/messages", post(legacy_submit_message))
}

// ── Preconditions ───────────────────────────────────────────────────────────

/// Resolve the deployment and authenticate the caller against it.
async fn admit(
    state: &AppState,
    deployment_id: &str,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<Deployment, GatewayError> {
    let found = state
        .directory
        .get(deployment_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let Some(deployment) = found else {
        tracing::warn!(deployment_id = %deployment_id, "unknown deployment");
        if state.config.conceal_unknown_deployments {
            return Err(GatewayError::Unauthorized("invalid access token".into()));
        }
        return Err(GatewayError::NotFound(deployment_id.to_string()));
    };

    auth::authorize(&deployment, headers, query)?;
    Ok(deployment)
}

/// The version the caller declared in the header, if any. Unsupported values
/// are refused, never downgraded.
fn declared_version(headers: &HeaderMap) -> Result<Option<String>, GatewayError> {
    let Some(raw) = headers.get(PROTOCOL_VERSION_HEADER) else {
        return Ok(None);
    };
    let version = raw
        .to_str()
        .map_err(|_| GatewayError::UnsupportedVersion("<non-ascii header>".into()))?
        .trim();
    if jsonrpc::is_supported_version(version) {
        Ok(Some(version.to_string()))
    } else {
        tracing::warn!("unsupported protocol version: {}", version);
        Err(GatewayError::UnsupportedVersion(version.to_string()))
    }
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Exactly one JSON object per body.
fn parse_message(body: &[u8]) -> Result<Value, GatewayError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| GatewayError::Parse(format!("invalid JSON: {e}")))?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Array(_) => Err(GatewayError::InvalidRequest(
            "batch requests are not supported".into(),
        )),
        _ => Err(GatewayError::InvalidRequest(
            "message must be a JSON object".into(),
        )),
    }
}

fn with_version(mut response: Response, version: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(version) {
        response
            .headers_mut()
            .entry(PROTOCOL_VERSION_HEADER)
            .or_insert(value);
    }
    response
}

fn fail(error: GatewayError) -> Response {
    with_version(error.into_response(), DEFAULT_PROTOCOL_VERSION)
}

// ── Message submission ──────────────────────────────────────────────────────

/// POST /api/mcp/{deployment_id}
async fn submit_message(
    State(state): State<AppState>,
    Path(deployment_id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    submit(&state, &deployment_id, query.as_deref(), &headers, &body, StatusCode::ACCEPTED).await
}

/// POST /api/mcp/{deployment_id}/messages
async fn legacy_submit_message(
    State(state): State<AppState>,
    Path(deployment_id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    submit(&state, &deployment_id, query.as_deref(), &headers, &body, StatusCode::NO_CONTENT).await
}

async fn submit(
    state: &AppState,
    deployment_id: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
    accepted: StatusCode,
) -> Response {
    let deployment = match admit(state, deployment_id, headers, query).await {
        Ok(d) => d,
        Err(e) => return fail(e),
    };
    let header_version = match declared_version(headers) {
        Ok(v) => v,
        Err(e) => return fail(e),
    };
    let message = match parse_message(body) {
        Ok(m) => m,
        Err(e) => return fail(e),
    };

    let meta = CallMeta {
        header_version,
        session_id: session_header(headers),
    };
    render(dispatch::dispatch(state, &deployment, message, meta).await, accepted)
}

fn render(result: Result<Dispatched, Rejected>, accepted: StatusCode) -> Response {
    match result {
        Ok(Dispatched {
            outcome,
            protocol_version,
        }) => {
            let response = match outcome {
                Outcome::Accepted => accepted.into_response(),
                Outcome::Reply {
                    status,
                    body,
                    session_id,
                } => {
                    let mut response = (status, Json(body)).into_response();
                    if let Some(value) = session_id.and_then(|s| HeaderValue::from_str(&s).ok()) {
                        response.headers_mut().insert(SESSION_ID_HEADER, value);
                    }
                    response
                }
                Outcome::Stream(response) => response,
            };
            with_version(response, &protocol_version)
        }
        Err(Rejected {
            error,
            id,
            protocol_version,
        }) => with_version(error.into_response_for(&id), &protocol_version),
    }
}

// ── Event channels ──────────────────────────────────────────────────────────

/// GET /api/mcp/{deployment_id}
async fn open_event_channel(
    State(state): State<AppState>,
    Path(deployment_id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let deployment = match admit(&state, &deployment_id, &headers, query.as_deref()).await {
        Ok(d) => d,
        Err(e) => return fail(e),
    };
    let header_version = match declared_version(&headers) {
        Ok(v) => v,
        Err(e) => return fail(e),
    };

    let session = match session_header(&headers) {
        Some(id) => state
            .sessions
            .get(&id)
            .await
            .filter(|s| s.deployment_id == deployment.id),
        None => None,
    };
    let version = header_version
        .or_else(|| session.as_ref().map(|s| s.protocol_version.clone()))
        .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string());
    // Only a session known for this deployment narrows the channel.
    let session_id = session.map(|s| s.id.clone());

    tracing::info!(
        deployment_id = %deployment.id,
        session_id = ?session_id,
        protocol_version = %version,
        "event channel opened"
    );

    let rx = state.events.subscribe(&deployment.id);
    stream::event_channel(
        &deployment.id,
        session_id,
        rx,
        Vec::new(),
        state.config.keepalive,
        Some(&version),
        state.shutdown.clone(),
    )
}

/// GET /api/mcp/{deployment_id}/sse
async fn legacy_event_channel(
    State(state): State<AppState>,
    Path(deployment_id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let deployment = match admit(&state, &deployment_id, &headers, query.as_deref()).await {
        Ok(d) => d,
        Err(e) => return fail(e),
    };

    let endpoint = format!(
        "{}/api/mcp/{}/messages",
        public_base(&state, &headers),
        deployment.id
    );
    tracing::info!(deployment_id = %deployment.id, endpoint = %endpoint, "legacy event channel opened");

    let rx = state.events.subscribe(&deployment.id);
    stream::event_channel(
        &deployment.id,
        None,
        rx,
        vec![Event::default().event("endpoint").data(endpoint)],
        state.config.legacy_keepalive,
        None,
        state.shutdown.clone(),
    )
}

/// Configured public URL, else the scheme and host the caller used.
fn public_base(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(url) = &state.config.public_url {
        return url.trim_end_matches('/').to_string();
    }
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let scheme = header("x-forwarded-proto").unwrap_or("http");
    match header("x-forwarded-host").or_else(|| header("host")) {
        Some(host) => format!("{scheme}://{host}"),
        None => String::new(),
    }
}
