//! Remote Machine Bridge. Forwards calls to machines on the private network.
//!
//! There is no connection state per deployment: every call is a fresh
//! outbound POST. The machine's address is found by trying each
//! [`Resolution`] strategy in order. Only a connection-level failure moves on
//! to the next strategy; any answer from the machine, including an HTTP error,
//! is final.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::response::Response;
use serde_json::Value;

use super::{BackendReply, BridgeError, CallContext};
use crate::config::RemoteSettings;
use crate::jsonrpc::{PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER};

/// Headers copied from a streamed machine response to the caller.
const PASSTHROUGH_HEADERS: [&str; 4] = [
    "content-type",
    "cache-control",
    "mcp-session-id",
    "mcp-protocol-version",
];

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// How to turn a machine id into a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// `<machine>.<private_domain>`; survives machine migration.
    InternalDns,
    /// Raw private address read from the machines API; covers DNS lag on
    /// freshly started machines.
    PrivateAddress,
}

impl Resolution {
    fn label(self) -> &'static str {
        match self {
            Resolution::InternalDns => "internal DNS",
            Resolution::PrivateAddress => "private address",
        }
    }
}

enum AttemptOutcome {
    Delivered(reqwest::Response),
    ConnectFailed(String),
    Failed(BridgeError),
}

pub struct RemoteBridge {
    client: reqwest::Client,
    settings: RemoteSettings,
    strategies: Vec<Resolution>,
}

impl RemoteBridge {
    pub fn new(settings: RemoteSettings) -> Result<Self, BridgeError> {
        Self::with_strategies(settings, vec![Resolution::InternalDns, Resolution::PrivateAddress])
    }

    pub fn with_strategies(settings: RemoteSettings, strategies: Vec<Resolution>) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| BridgeError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            settings,
            strategies,
        })
    }

    /// Deliver `message` to `machine_id` and return its reply.
    pub async fn invoke(
        &self,
        machine_id: &str,
        message: &Value,
        ctx: &CallContext,
    ) -> Result<BackendReply, BridgeError> {
        if !is_valid_machine_id(machine_id) {
            return Err(BridgeError::Unavailable(format!(
                "deployment has an invalid machine id '{machine_id}'"
            )));
        }

        let mut connect_failures: Vec<String> = Vec::new();

        for &strategy in &self.strategies {
            let url = match self.resolve(strategy, machine_id).await {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(machine_id = %machine_id, "{} resolution failed: {}", strategy.label(), e);
                    return Err(BridgeError::Unavailable(unreachable_message(
                        machine_id,
                        &connect_failures,
                        Some(&format!("{} lookup failed: {e}", strategy.label())),
                    )));
                }
            };

            tracing::debug!(machine_id = %machine_id, url = %url, "remote invoke via {}", strategy.label());

            match self.attempt(&url, message, ctx).await {
                AttemptOutcome::Delivered(resp) => return into_reply(resp).await,
                AttemptOutcome::ConnectFailed(reason) => {
                    tracing::warn!(
                        machine_id = %machine_id,
                        "connection via {} failed: {}",
                        strategy.label(),
                        reason
                    );
                    connect_failures.push(format!("{} ({url}): {reason}", strategy.label()));
                }
                AttemptOutcome::Failed(e) => return Err(e),
            }
        }

        Err(BridgeError::Unavailable(unreachable_message(
            machine_id,
            &connect_failures,
            None,
        )))
    }

    async fn resolve(&self, strategy: Resolution, machine_id: &str) -> Result<String, BridgeError> {
        let host = match strategy {
            Resolution::InternalDns => format!("{machine_id}.{}", self.settings.private_domain),
            Resolution::PrivateAddress => {
                let ip = self.private_address(machine_id).await?;
                if ip.contains(':') { format!("[{ip}]") } else { ip }
            }
        };
        Ok(format!(
            "http://{host}:{}{}",
            self.settings.machine_port, self.settings.path
        ))
    }

    async fn private_address(&self, machine_id: &str) -> Result<String, BridgeError> {
        let url = format!(
            "{}/apps/{}/machines/{}",
            self.settings.machines_api.trim_end_matches('/'),
            self.settings.app_name,
            machine_id
        );

        let mut req = self.client.get(&url);
        if let Some(token) = &self.settings.api_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| BridgeError::Http(format!("machines API request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(BridgeError::Http(format!(
                "machines API returned {}",
                resp.status()
            )));
        }

        let record: Value = resp
            .json()
            .await
            .map_err(|e| BridgeError::Malformed(format!("machines API body: {e}")))?;
        record
            .get("private_ip")
            .and_then(Value::as_str)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BridgeError::Malformed("machine record has no private_ip".into()))
    }

    async fn attempt(&self, url: &str, message: &Value, ctx: &CallContext) -> AttemptOutcome {
        let mut req = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ACCEPT_BOTH)
            .header(PROTOCOL_VERSION_HEADER, &ctx.protocol_version)
            .json(message);
        if let Some(session_id) = &ctx.session_id {
            req = req.header(SESSION_ID_HEADER, session_id);
        }

        match req.send().await {
            Ok(resp) => AttemptOutcome::Delivered(resp),
            // Checked before is_timeout: a connect timeout is still a
            // connection failure and should fall through to the next strategy.
            Err(e) if e.is_connect() => AttemptOutcome::ConnectFailed(error_chain(&e)),
            Err(e) if e.is_timeout() => {
                AttemptOutcome::Failed(BridgeError::Timeout(self.settings.request_timeout))
            }
            Err(e) => AttemptOutcome::Failed(BridgeError::Http(error_chain(&e))),
        }
    }
}

fn is_valid_machine_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn unreachable_message(machine_id: &str, failures: &[String], lookup: Option<&str>) -> String {
    let mut msg = format!("connection to machine {machine_id} failed");
    if !failures.is_empty() {
        msg.push_str(": ");
        msg.push_str(&failures.join("; "));
    }
    if let Some(lookup) = lookup {
        msg.push_str("; ");
        msg.push_str(lookup);
    }
    msg
}

/// reqwest's Display stops at the top error; the cause is usually deeper.
fn error_chain(err: &reqwest::Error) -> String {
    let mut out = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

async fn into_reply(resp: reqwest::Response) -> Result<BackendReply, BridgeError> {
    let status = resp.status();
    let is_stream = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if is_stream {
        let mut builder = Response::builder().status(status);
        for name in PASSTHROUGH_HEADERS {
            if let Some(value) = resp.headers().get(name) {
                builder = builder.header(name, value.clone());
            }
        }
        return builder
            .body(Body::from_stream(resp.bytes_stream()))
            .map(BackendReply::Stream)
            .map_err(|e| BridgeError::Http(e.to_string()));
    }

    let session_id = resp
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| BridgeError::Http(format!("reading machine response: {e}")))?;

    if bytes.is_empty() && status.is_success() {
        // Accepted notifications come back bodiless.
        return Ok(BackendReply::Json {
            status,
            body: Value::Null,
            session_id,
        });
    }

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(body) => Ok(BackendReply::Json {
            status,
            body,
            session_id,
        }),
        Err(_) if !status.is_success() => Err(BridgeError::Http(format!(
            "machine returned {status}: {}",
            String::from_utf8_lossy(&bytes[..bytes.len().min(200)])
        ))),
        Err(e) => Err(BridgeError::Malformed(format!("machine response: {e}"))),
    }
}

/// Per-call handle for a `remote` deployment.
pub struct RemoteMachineTarget {
    machine_id: String,
    bridge: Arc<RemoteBridge>,
}

impl RemoteMachineTarget {
    pub fn new(machine_id: impl Into<String>, bridge: Arc<RemoteBridge>) -> Self {
        Self {
            machine_id: machine_id.into(),
            bridge,
        }
    }

    pub async fn invoke(&self, message: &Value, ctx: &CallContext) -> Result<BackendReply, BridgeError> {
        self.bridge.invoke(&self.machine_id, message, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use serde_json::json;
    use std::time::Duration;

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    /// A machine that echoes the request id and the forwarded headers.
    async fn machine() -> u16 {
        async fn handle(headers: HeaderMap, axum::Json(body): axum::Json<Value>) -> impl IntoResponse {
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            axum::Json(json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "result": {
                    "version": header("mcp-protocol-version"),
                    "session": header("mcp-session-id"),
                    "accept": header("accept"),
                }
            }))
        }
        serve(Router::new().route("/mcp", post(handle))).await
    }

    /// A machines API that knows exactly one machine.
    async fn machines_api(private_ip: &'static str) -> u16 {
        let app = Router::new().route(
            "/v1/apps/{app}/machines/{id}",
            get(move |Path((_app, id)): Path<(String, String)>| async move {
                if id == "m1" {
                    axum::Json(json!({ "id": id, "private_ip": private_ip })).into_response()
                } else {
                    StatusCode::NOT_FOUND.into_response()
                }
            }),
        );
        serve(app).await
    }

    fn settings(machine_port: u16, api_port: u16) -> RemoteSettings {
        RemoteSettings {
            machines_api: format!("http://127.0.0.1:{api_port}/v1"),
            // Reserved TLD, never resolves.
            private_domain: "machines.invalid".to_string(),
            machine_port,
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            ..RemoteSettings::for_app("test-app")
        }
    }

    fn ctx() -> CallContext {
        CallContext {
            protocol_version: "2025-03-26".into(),
            session_id: Some("sess-1".into()),
        }
    }

    fn request() -> Value {
        json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call", "params": {"name": "x"}})
    }

    #[tokio::test]
    async fn falls_back_to_private_address_when_dns_fails() {
        let machine_port = machine().await;
        let api_port = machines_api("127.0.0.1").await;
        let bridge = RemoteBridge::new(settings(machine_port, api_port)).unwrap();

        let reply = bridge.invoke("m1", &request(), &ctx()).await.unwrap();
        let BackendReply::Json { status, body, .. } = reply else {
            panic!("expected a JSON reply");
        };
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 7);
        assert_eq!(body["result"]["version"], "2025-03-26");
        assert_eq!(body["result"]["session"], "sess-1");
        assert_eq!(body["result"]["accept"], ACCEPT_BOTH);
    }

    #[tokio::test]
    async fn failed_lookup_after_connect_failure_is_unavailable() {
        let api_port = machines_api("127.0.0.1").await;
        let bridge = RemoteBridge::new(settings(1, api_port)).unwrap();

        let err = bridge.invoke("unknown-machine", &request(), &ctx()).await.err().unwrap();
        let BridgeError::Unavailable(msg) = err else {
            panic!("expected Unavailable, got {err:?}");
        };
        assert!(msg.contains("connection to machine unknown-machine failed"), "{msg}");
        assert!(msg.contains("internal DNS"), "{msg}");
        assert!(msg.contains("404"), "{msg}");
    }

    #[tokio::test]
    async fn every_strategy_refused_is_unavailable() {
        // Port 1 on loopback refuses connections.
        let api_port = machines_api("127.0.0.1").await;
        let bridge = RemoteBridge::new(settings(1, api_port)).unwrap();

        let err = bridge.invoke("m1", &request(), &ctx()).await.err().unwrap();
        let BridgeError::Unavailable(msg) = err else {
            panic!("expected Unavailable, got {err:?}");
        };
        assert!(msg.contains("private address"), "{msg}");
    }

    #[tokio::test]
    async fn backend_http_errors_do_not_trigger_fallback() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(json!({"jsonrpc": "2.0", "id": 7, "error": {"code": -32000, "message": "tool blew up"}})),
                )
            }),
        );
        let machine_port = serve(app).await;
        let api_port = machines_api("127.0.0.1").await;
        // Address lookup first, so the first attempt connects and answers 500.
        let bridge = RemoteBridge::with_strategies(
            settings(machine_port, api_port),
            vec![Resolution::PrivateAddress, Resolution::InternalDns],
        )
        .unwrap();

        let reply = bridge.invoke("m1", &request(), &ctx()).await.unwrap();
        let BackendReply::Json { status, body, .. } = reply else {
            panic!("expected a JSON reply");
        };
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "tool blew up");
    }

    #[tokio::test]
    async fn event_stream_is_passed_through() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                (
                    [
                        ("content-type", "text/event-stream"),
                        ("mcp-session-id", "remote-sess"),
                        ("x-internal", "secret"),
                    ],
                    "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{}}\n\n",
                )
            }),
        );
        let machine_port = serve(app).await;
        let api_port = machines_api("127.0.0.1").await;
        let bridge = RemoteBridge::with_strategies(
            settings(machine_port, api_port),
            vec![Resolution::PrivateAddress],
        )
        .unwrap();

        let reply = bridge.invoke("m1", &request(), &ctx()).await.unwrap();
        let BackendReply::Stream(resp) = reply else {
            panic!("expected a streamed reply");
        };
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        assert_eq!(resp.headers()["mcp-session-id"], "remote-sess");
        assert!(resp.headers().get("x-internal").is_none());

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("\"id\":7"));
    }

    #[tokio::test]
    async fn invalid_machine_id_never_leaves_the_gateway() {
        let bridge = RemoteBridge::new(settings(1, 1)).unwrap();
        let err = bridge.invoke("evil.host/x", &request(), &ctx()).await.err().unwrap();
        assert!(matches!(err, BridgeError::Unavailable(_)));
    }

    #[tokio::test]
    async fn ipv6_addresses_are_bracketed() {
        let api_port = machines_api("fdaa:0:1::2").await;
        let bridge =
            RemoteBridge::with_strategies(settings(8080, api_port), vec![Resolution::PrivateAddress]).unwrap();
        let url = bridge.resolve(Resolution::PrivateAddress, "m1").await.unwrap();
        assert_eq!(url, "http://[fdaa:0:1::2]:8080/mcp");
    }
}
