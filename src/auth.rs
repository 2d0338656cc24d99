// Deployment bearer-token authentication.
//
// A caller proves access to one deployment by presenting that deployment's
// access token, either as `Authorization: Bearer <token>` or as `?token=<token>`
// (event-stream clients often cannot set headers). The header wins when both
// are present. Comparison is constant-time.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use subtle::ConstantTimeEq;

use crate::directory::Deployment;
use crate::error::GatewayError;

/// Extract the presented credential from the header or the raw query string.
pub fn presented_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
            .filter(|t| !t.is_empty())
    })
}

pub fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Authorize a call against a known deployment.
pub fn authorize(
    deployment: &Deployment,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<(), GatewayError> {
    let Some(token) = presented_token(headers, query) else {
        tracing::warn!(deployment_id = %deployment.id, "auth failed: no credential presented");
        return Err(GatewayError::Unauthorized("missing bearer token".into()));
    };
    if token_matches(&token, &deployment.access_token) {
        Ok(())
    } else {
        tracing::warn!(deployment_id = %deployment.id, "auth failed: invalid token");
        Err(GatewayError::Unauthorized("invalid access token".into()))
    }
}
