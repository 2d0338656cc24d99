//! Message classification and method dispatch.
//!
//! Requests for protocol-management methods are answered here from the
//! deployment's capability manifest and never reach a backend. The
//! forwarded set goes to the deployment's current [`BackendTarget`].
//! Notifications and caller responses are acknowledged at once and handed
//! to the backend in the background.

use axum::http::StatusCode;
use axum::response::Response;
use serde_json::{Value, json};

use crate::bridge::remote::RemoteMachineTarget;
use crate::bridge::{BackendReply, BackendTarget, CallContext};
use crate::directory::{Deployment, HostingMode};
use crate::error::GatewayError;
use crate::jsonrpc::{self, DEFAULT_PROTOCOL_VERSION, MessageKind};
use crate::session::Session;
use crate::state::AppState;

/// Methods relayed to the backend unchanged.
pub const FORWARDED_METHODS: [&str; 8] = [
    "tools/call",
    "resources/read",
    "resources/templates/list",
    "resources/subscribe",
    "resources/unsubscribe",
    "prompts/get",
    "completion/complete",
    "logging/setLevel",
];

/// Protocol facts the transport layer extracted from headers.
#[derive(Debug, Clone, Default)]
pub struct CallMeta {
    /// Already validated against the supported set.
    pub header_version: Option<String>,
    pub session_id: Option<String>,
}

pub enum Outcome {
    /// Nothing to answer (notification or caller response).
    Accepted,
    Reply {
        status: StatusCode,
        body: Value,
        session_id: Option<String>,
    },
    Stream(Response),
}

pub struct Dispatched {
    pub outcome: Outcome,
    pub protocol_version: String,
}

/// A failure addressed to a specific request id.
pub struct Rejected {
    pub error: GatewayError,
    pub id: Value,
    pub protocol_version: String,
}

pub async fn dispatch(
    state: &AppState,
    deployment: &Deployment,
    message: Value,
    meta: CallMeta,
) -> Result<Dispatched, Rejected> {
    let session = match &meta.session_id {
        Some(id) => state
            .sessions
            .get(id)
            .await
            .filter(|s| s.deployment_id == deployment.id),
        None => None,
    };
    let protocol_version = meta
        .header_version
        .clone()
        .or_else(|| session.as_ref().map(|s| s.protocol_version.clone()))
        .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string());

    let Some(kind) = jsonrpc::classify(&message) else {
        return Err(Rejected {
            error: GatewayError::InvalidRequest(
                "expected a JSON-RPC request, notification or response".into(),
            ),
            id: message.get("id").cloned().unwrap_or(Value::Null),
            protocol_version,
        });
    };

    let ctx = CallContext {
        protocol_version: protocol_version.clone(),
        session_id: meta.session_id.clone(),
    };

    match kind {
        MessageKind::Notification { method } => {
            tracing::info!(deployment_id = %deployment.id, method = %method, "notification accepted");
            deliver_in_background(state.clone(), deployment.clone(), message, ctx);
            Ok(Dispatched {
                outcome: Outcome::Accepted,
                protocol_version,
            })
        }
        MessageKind::Response { id } => {
            tracing::info!(deployment_id = %deployment.id, id = %id, "caller response accepted");
            deliver_in_background(state.clone(), deployment.clone(), message, ctx);
            Ok(Dispatched {
                outcome: Outcome::Accepted,
                protocol_version,
            })
        }
        MessageKind::Request { id, method } => {
            let reject = |error: GatewayError, version: &str| Rejected {
                error,
                id: id.clone(),
                protocol_version: version.to_string(),
            };

            let manifest = &deployment.manifest;
            let answered = match method.as_str() {
                "initialize" => {
                    return Ok(handshake(state, deployment, &id, &message, &meta, session).await);
                }
                "ping" => json!({}),
                "tools/list" => json!({ "tools": manifest.tools }),
                "resources/list" => json!({ "resources": manifest.resources }),
                "prompts/list" => json!({ "prompts": manifest.prompts }),
                m if FORWARDED_METHODS.contains(&m) => {
                    let target = backend_for(state, deployment)
                        .await
                        .map_err(|e| reject(e, &protocol_version))?;
                    tracing::info!(
                        deployment_id = %deployment.id,
                        method = %method,
                        backend = target.kind(),
                        "forwarding request"
                    );
                    let reply = target
                        .call(&message, &ctx)
                        .await
                        .map_err(|e| reject(e.into(), &protocol_version))?;
                    let outcome = match reply {
                        BackendReply::Json {
                            status,
                            body,
                            session_id,
                        } => Outcome::Reply {
                            status,
                            body,
                            session_id,
                        },
                        BackendReply::Stream(response) => Outcome::Stream(response),
                    };
                    return Ok(Dispatched {
                        outcome,
                        protocol_version,
                    });
                }
                other => {
                    tracing::warn!(deployment_id = %deployment.id, method = %other, "unknown method");
                    return Err(reject(
                        GatewayError::MethodNotFound(other.to_string()),
                        &protocol_version,
                    ));
                }
            };

            Ok(Dispatched {
                outcome: Outcome::Reply {
                    status: StatusCode::OK,
                    body: jsonrpc::success(&id, answered),
                    session_id: None,
                },
                protocol_version,
            })
        }
    }
}

/// Answer `initialize`. A known session for this deployment is
/// re-confirmed as is; otherwise a new one is allocated.
async fn handshake(
    state: &AppState,
    deployment: &Deployment,
    id: &Value,
    message: &Value,
    meta: &CallMeta,
    existing: Option<std::sync::Arc<Session>>,
) -> Dispatched {
    let (session_id, protocol_version) = match existing {
        Some(session) => {
            tracing::debug!(session_id = %session.id, "handshake re-confirms existing session");
            (session.id.clone(), session.protocol_version.clone())
        }
        None => {
            let declared = message
                .pointer("/params/protocolVersion")
                .and_then(Value::as_str)
                .filter(|v| jsonrpc::is_supported_version(v))
                .map(str::to_string);
            let version = declared
                .or_else(|| meta.header_version.clone())
                .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string());
            let session_id = state.sessions.create(&deployment.id, &version).await;
            (session_id, version)
        }
    };

    tracing::info!(
        deployment_id = %deployment.id,
        session_id = %session_id,
        protocol_version = %protocol_version,
        "handshake complete"
    );

    let result = json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "tools": {},
            "resources": {},
            "prompts": {},
            "logging": {},
        },
        "serverInfo": {
            "name": deployment.name,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "_meta": { "sessionId": session_id },
    });

    Dispatched {
        outcome: Outcome::Reply {
            status: StatusCode::OK,
            body: jsonrpc::success(id, result),
            session_id: Some(session_id),
        },
        protocol_version,
    }
}

/// Resolve the backend for a forwarded request, lazily starting a local
/// process when the deployment carries a launch configuration.
async fn backend_for(state: &AppState, deployment: &Deployment) -> Result<BackendTarget, GatewayError> {
    match &deployment.hosting {
        HostingMode::Local => {
            let Some(launch) = &deployment.launch else {
                return state
                    .processes
                    .get(&deployment.id)
                    .await
                    .map(BackendTarget::Local)
                    .ok_or_else(|| {
                        GatewayError::BackendUnavailable(format!(
                            "no backend process running for deployment {}",
                            deployment.id
                        ))
                    });
            };
            // Reuses a live process; replaces a dead one.
            let target = state
                .processes
                .start(&deployment.id, &launch.launch_spec(), &launch.environment())
                .await?;
            Ok(BackendTarget::Local(target))
        }
        HostingMode::Remote { machine_id } => Ok(BackendTarget::Remote(RemoteMachineTarget::new(
            machine_id.clone(),
            state.remote.clone(),
        ))),
        HostingMode::Unprovisioned => Err(GatewayError::BackendUnavailable(format!(
            "deployment {} has no provisioned backend",
            deployment.id
        ))),
    }
}

/// Backend that can take a one-way message right now. Never starts one.
async fn existing_backend(state: &AppState, deployment: &Deployment) -> Option<BackendTarget> {
    match &deployment.hosting {
        HostingMode::Local => state
            .processes
            .get(&deployment.id)
            .await
            .filter(|t| t.is_alive())
            .map(BackendTarget::Local),
        HostingMode::Remote { machine_id } => Some(BackendTarget::Remote(RemoteMachineTarget::new(
            machine_id.clone(),
            state.remote.clone(),
        ))),
        HostingMode::Unprovisioned => None,
    }
}

fn deliver_in_background(state: AppState, deployment: Deployment, message: Value, ctx: CallContext) {
    tokio::spawn(async move {
        let Some(target) = existing_backend(&state, &deployment).await else {
            tracing::debug!(deployment_id = %deployment.id, "no live backend, dropping one-way message");
            return;
        };
        if let Err(e) = target.deliver(&message, &ctx).await {
            tracing::warn!(deployment_id = %deployment.id, "one-way delivery failed: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::directory::{CapabilityManifest, MemoryDirectory};
    use std::sync::Arc;

    fn deployment(hosting: HostingMode) -> Deployment {
        Deployment {
            id: "dep-1".into(),
            name: "Weather".into(),
            hosting,
            access_token: "tok".into(),
            manifest: CapabilityManifest {
                tools: vec![json!({"name": "forecast", "inputSchema": {"type": "object"}})],
                resources: vec![],
                prompts: vec![json!({"name": "summary"})],
            },
            launch: None,
        }
    }

    fn state() -> AppState {
        AppState::new(GatewayConfig::default(), Arc::new(MemoryDirectory::new())).unwrap()
    }

    fn reply_body(d: Dispatched) -> (Value, Option<String>) {
        match d.outcome {
            Outcome::Reply { body, session_id, .. } => (body, session_id),
            _ => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn handshake_allocates_session_with_declared_version() {
        let state = state();
        let dep = deployment(HostingMode::Local);
        let msg = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2024-11-05"}});

        let d = dispatch(&state, &dep, msg, CallMeta::default()).await.ok().unwrap();
        assert_eq!(d.protocol_version, "2024-11-05");
        let (body, sid) = reply_body(d);
        let sid = sid.unwrap();
        assert_eq!(body["result"]["_meta"]["sessionId"], sid.as_str());
        assert_eq!(body["result"]["serverInfo"]["name"], "Weather");
        assert_eq!(state.sessions.get(&sid).await.unwrap().protocol_version, "2024-11-05");
    }

    #[tokio::test]
    async fn unsupported_declared_version_falls_back_to_default() {
        let state = state();
        let dep = deployment(HostingMode::Local);
        let msg = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "1999-01-01"}});

        let d = dispatch(&state, &dep, msg, CallMeta::default()).await.ok().unwrap();
        assert_eq!(d.protocol_version, DEFAULT_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn repeated_handshake_reconfirms_session() {
        let state = state();
        let dep = deployment(HostingMode::Local);
        let msg = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2025-03-26"}});

        let first = dispatch(&state, &dep, msg.clone(), CallMeta::default()).await.ok().unwrap();
        let (_, sid) = reply_body(first);
        let meta = CallMeta {
            header_version: None,
            session_id: sid.clone(),
        };
        let again = json!({"jsonrpc": "2.0", "id": 2, "method": "initialize", "params": {"protocolVersion": "2025-06-18"}});
        let second = dispatch(&state, &dep, again, meta).await.ok().unwrap();

        assert_eq!(second.protocol_version, "2025-03-26");
        let (_, sid2) = reply_body(second);
        assert_eq!(sid, sid2);
        assert_eq!(state.sessions.len().await, 1);
    }

    #[tokio::test]
    async fn listings_come_from_manifest() {
        let state = state();
        let dep = deployment(HostingMode::Unprovisioned);

        for (method, key) in [("tools/list", "tools"), ("resources/list", "resources"), ("prompts/list", "prompts")] {
            let msg = json!({"jsonrpc": "2.0", "id": 5, "method": method});
            let (body, _) = reply_body(dispatch(&state, &dep, msg, CallMeta::default()).await.ok().unwrap());
            assert_eq!(body["id"], 5);
            let expected = match key {
                "tools" => &dep.manifest.tools,
                "resources" => &dep.manifest.resources,
                _ => &dep.manifest.prompts,
            };
            assert_eq!(body["result"][key], json!(expected));
        }
    }

    #[tokio::test]
    async fn ping_answers_empty_result() {
        let state = state();
        let dep = deployment(HostingMode::Unprovisioned);
        let msg = json!({"jsonrpc": "2.0", "id": "p", "method": "ping"});
        let (body, _) = reply_body(dispatch(&state, &dep, msg, CallMeta::default()).await.ok().unwrap());
        assert_eq!(body, json!({"jsonrpc": "2.0", "id": "p", "result": {}}));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected_with_request_id() {
        let state = state();
        let dep = deployment(HostingMode::Local);
        let msg = json!({"jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage"});
        let Err(rejected) = dispatch(&state, &dep, msg, CallMeta::default()).await else {
            panic!("expected rejection");
        };
        assert!(matches!(rejected.error, GatewayError::MethodNotFound(_)));
        assert_eq!(rejected.id, 9);
    }

    #[tokio::test]
    async fn forwarded_call_without_backend_is_unavailable() {
        let state = state();
        for hosting in [HostingMode::Local, HostingMode::Unprovisioned] {
            let dep = deployment(hosting);
            let msg = json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "forecast"}});
            let Err(rejected) = dispatch(&state, &dep, msg, CallMeta::default()).await else {
                panic!("expected rejection");
            };
            assert!(matches!(rejected.error, GatewayError::BackendUnavailable(_)));
            assert_eq!(rejected.error.status(), StatusCode::BAD_GATEWAY);
        }
    }

    #[tokio::test]
    async fn one_way_messages_are_accepted() {
        let state = state();
        let dep = deployment(HostingMode::Local);
        for msg in [
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            json!({"jsonrpc": "2.0", "id": 4, "result": {}}),
            json!({"jsonrpc": "2.0", "id": 4, "error": {"code": -1, "message": "no"}}),
        ] {
            let d = dispatch(&state, &dep, msg, CallMeta::default()).await.ok().unwrap();
            assert!(matches!(d.outcome, Outcome::Accepted));
        }
    }

    #[tokio::test]
    async fn session_version_applies_without_header() {
        let state = state();
        let dep = deployment(HostingMode::Unprovisioned);
        let sid = state.sessions.create(&dep.id, "2024-11-05").await;
        let meta = CallMeta {
            header_version: None,
            session_id: Some(sid),
        };
        let d = dispatch(&state, &dep, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}), meta)
            .await
            .ok()
            .unwrap();
        assert_eq!(d.protocol_version, "2024-11-05");
    }

    #[tokio::test]
    async fn unclassifiable_message_is_invalid_request() {
        let state = state();
        let dep = deployment(HostingMode::Local);
        let Err(rejected) = dispatch(&state, &dep, json!({"jsonrpc": "2.0", "id": 1}), CallMeta::default()).await else {
            panic!("expected rejection");
        };
        assert_eq!(rejected.error.code(), jsonrpc::INVALID_REQUEST);
    }
}
