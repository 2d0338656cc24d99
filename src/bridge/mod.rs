// ---------------------------------------------------------------------------
// Backend targets: the two ways a deployment's backend is reached.
// ---------------------------------------------------------------------------

pub mod local;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::Response;
use serde_json::Value;

use self::local::LocalProcessTarget;
use self::remote::RemoteMachineTarget;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to launch backend: {0}")]
    Spawn(String),

    #[error("backend I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend did not answer within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("malformed backend reply: {0}")]
    Malformed(String),

    #[error("backend process exited")]
    Closed,

    #[error("{0}")]
    Unavailable(String),

    #[error("backend HTTP error: {0}")]
    Http(String),
}

/// What a backend sent back for one request.
pub enum BackendReply {
    /// A single buffered JSON-RPC message.
    Json {
        status: StatusCode,
        body: Value,
        session_id: Option<String>,
    },
    /// An event stream passed through untouched.
    Stream(Response),
}

impl BackendReply {
    pub fn json(body: Value) -> Self {
        BackendReply::Json {
            status: StatusCode::OK,
            body,
            session_id: None,
        }
    }
}

/// Caller-side protocol facts forwarded with every call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub protocol_version: String,
    pub session_id: Option<String>,
}

pub enum BackendTarget {
    Local(Arc<LocalProcessTarget>),
    Remote(RemoteMachineTarget),
}

impl BackendTarget {
    /// Forward one request and wait for its reply.
    pub async fn call(&self, message: &Value, ctx: &CallContext) -> Result<BackendReply, BridgeError> {
        match self {
            BackendTarget::Local(target) => {
                let id = message.get("id").cloned().unwrap_or(Value::Null);
                let method = message
                    .get("method")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BridgeError::Malformed("request without method".into()))?;
                let reply = target
                    .invoke(method, message.get("params"), &id, ctx.session_id.as_deref())
                    .await?;
                Ok(BackendReply::json(reply))
            }
            BackendTarget::Remote(target) => target.invoke(message, ctx).await,
        }
    }

    /// Hand over a message that expects no answer.
    pub async fn deliver(&self, message: &Value, ctx: &CallContext) -> Result<(), BridgeError> {
        match self {
            BackendTarget::Local(target) => target.deliver(message).await,
            BackendTarget::Remote(target) => target.invoke(message, ctx).await.map(|_| ()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendTarget::Local(_) => "local",
            BackendTarget::Remote(_) => "remote",
        }
    }
}
