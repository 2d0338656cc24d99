// ---------------------------------------------------------------------------
// Gateway error type
// ---------------------------------------------------------------------------

use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::bridge::BridgeError;
use crate::jsonrpc::{self, SUPPORTED_PROTOCOL_VERSIONS};

/// Every failure the gateway can report to a caller.
///
/// Each variant maps to an HTTP status and a JSON-RPC error code, and is
/// always rendered in the wire protocol's own error shape so conforming
/// clients can parse the outcome:
///
/// ```json
/// { "jsonrpc": "2.0", "id": null, "error": { "code": -32600, "message": "...", "data": {...} } }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Deployment not found: {0}")]
    NotFound(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend timed out: {0}")]
    BackendTimeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> i64 {
        match self {
            GatewayError::Unauthorized(_) => jsonrpc::UNAUTHORIZED,
            GatewayError::NotFound(_) => jsonrpc::DEPLOYMENT_NOT_FOUND,
            GatewayError::UnsupportedVersion(_) | GatewayError::InvalidRequest(_) => {
                jsonrpc::INVALID_REQUEST
            }
            GatewayError::Parse(_) => jsonrpc::PARSE_ERROR,
            GatewayError::MethodNotFound(_) => jsonrpc::METHOD_NOT_FOUND,
            GatewayError::InvalidParams(_) => jsonrpc::INVALID_PARAMS,
            GatewayError::BackendUnavailable(_)
            | GatewayError::BackendTimeout(_)
            | GatewayError::Internal(_) => jsonrpc::INTERNAL_ERROR,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::UnsupportedVersion(_)
            | GatewayError::Parse(_)
            | GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            // Method-level errors travel inside a normal 200 JSON-RPC reply.
            GatewayError::MethodNotFound(_) | GatewayError::InvalidParams(_) => StatusCode::OK,
            GatewayError::BackendUnavailable(_) | GatewayError::Internal(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn data(&self) -> Option<Value> {
        match self {
            GatewayError::UnsupportedVersion(_) => {
                Some(json!({ "supported_versions": SUPPORTED_PROTOCOL_VERSIONS }))
            }
            _ => None,
        }
    }

    /// JSON-RPC error body addressed to `id`.
    pub fn to_body(&self, id: &Value) -> Value {
        jsonrpc::error(id, self.code(), &self.to_string(), self.data())
    }

    /// Render as an HTTP response answering the request `id`.
    pub fn into_response_for(self, id: &Value) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "gateway error ({}): {}", status.as_u16(), self);
        } else {
            tracing::debug!(code = self.code(), "gateway error ({}): {}", status.as_u16(), self);
        }

        let mut response = (status, Json(self.to_body(id))).into_response();
        if matches!(self, GatewayError::Unauthorized(_)) {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_for(&Value::Null)
    }
}

impl From<BridgeError> for GatewayError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Timeout(_) => GatewayError::BackendTimeout(err.to_string()),
            BridgeError::Unavailable(_) | BridgeError::Spawn(_) | BridgeError::Closed => {
                GatewayError::BackendUnavailable(err.to_string())
            }
            BridgeError::Io(_) | BridgeError::Malformed(_) | BridgeError::Http(_) => {
                GatewayError::Internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_code_mapping() {
        let cases = [
            (GatewayError::Unauthorized("x".into()), 401, jsonrpc::UNAUTHORIZED),
            (GatewayError::NotFound("x".into()), 404, jsonrpc::DEPLOYMENT_NOT_FOUND),
            (GatewayError::UnsupportedVersion("x".into()), 400, jsonrpc::INVALID_REQUEST),
            (GatewayError::Parse("x".into()), 400, jsonrpc::PARSE_ERROR),
            (GatewayError::MethodNotFound("x".into()), 200, jsonrpc::METHOD_NOT_FOUND),
            (GatewayError::BackendUnavailable("x".into()), 502, jsonrpc::INTERNAL_ERROR),
            (GatewayError::BackendTimeout("x".into()), 504, jsonrpc::INTERNAL_ERROR),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{err}");
            assert_eq!(err.code(), code, "{err}");
        }
    }

    #[test]
    fn unsupported_version_lists_supported_versions() {
        let body = GatewayError::UnsupportedVersion("1999-01-01".into()).to_body(&Value::Null);
        assert_eq!(body["error"]["code"], -32600);
        let listed = body["error"]["data"]["supported_versions"].as_array().unwrap();
        assert_eq!(listed.len(), SUPPORTED_PROTOCOL_VERSIONS.len());
        assert!(body["error"]["message"].as_str().unwrap().contains("1999-01-01"));
    }

    #[test]
    fn bridge_errors_keep_their_category() {
        let timeout: GatewayError = BridgeError::Timeout(std::time::Duration::from_secs(30)).into();
        assert!(matches!(timeout, GatewayError::BackendTimeout(_)));

        let closed: GatewayError = BridgeError::Closed.into();
        assert!(matches!(closed, GatewayError::BackendUnavailable(_)));

        let malformed: GatewayError = BridgeError::Malformed("x".into()).into();
        assert!(matches!(malformed, GatewayError::Internal(_)));
    }
}
