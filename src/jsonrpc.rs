//! JSON-RPC 2.0 message shapes used on the MCP wire.
//!
//! The gateway never deserialises messages into rigid structs: bodies are
//! forwarded to backends verbatim, so classification works on the raw
//! `serde_json::Value` and only looks at `id`, `method`, `result` and `error`.

use serde_json::{Value, json};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const UNAUTHORIZED: i64 = -32000;
pub const DEPLOYMENT_NOT_FOUND: i64 = -32001;

/// Protocol revisions the gateway speaks, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// What a submitted message is, decided from its fields alone.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// `id` + `method`: must be answered.
    Request { id: Value, method: String },
    /// `method` without `id`: acknowledged, never answered.
    Notification { method: String },
    /// `result` or `error` without `method`: the caller answering a
    /// server-initiated request.
    Response { id: Value },
}

/// Classify a parsed message body. Returns `None` for shapes that fit no
/// category (arrays, scalars, objects with neither method nor result/error).
pub fn classify(message: &Value) -> Option<MessageKind> {
    let obj = message.as_object()?;
    let method = obj.get("method").and_then(Value::as_str);
    // A present-but-null id is still "no id" for notification purposes.
    let id = obj.get("id").filter(|v| !v.is_null()).cloned();

    match (method, id) {
        (Some(m), Some(id)) => Some(MessageKind::Request {
            id,
            method: m.to_string(),
        }),
        (Some(m), None) => Some(MessageKind::Notification {
            method: m.to_string(),
        }),
        (None, id) if obj.contains_key("result") || obj.contains_key("error") => {
            Some(MessageKind::Response {
                id: id.unwrap_or(Value::Null),
            })
        }
        _ => None,
    }
}

pub fn success(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn error(id: &Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut err = json!({ "code": code, "message": message });
    if let Some(d) = data {
        err["data"] = d;
    }
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": err,
    })
}

/// Build an outbound request frame.
pub fn request(id: &Value, method: &str, params: Option<&Value>) -> Value {
    let mut msg = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if let Some(p) = params {
        msg["params"] = p.clone();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_has_id_and_method() {
        let kind = classify(&json!({"jsonrpc":"2.0","id":1,"method":"tools/list"}));
        assert_eq!(
            kind,
            Some(MessageKind::Request {
                id: json!(1),
                method: "tools/list".into()
            })
        );
    }

    #[test]
    fn string_ids_are_preserved() {
        let kind = classify(&json!({"id":"abc","method":"ping"})).unwrap();
        assert!(matches!(kind, MessageKind::Request { id, .. } if id == json!("abc")));
    }

    #[test]
    fn notification_has_no_id() {
        let kind = classify(&json!({"jsonrpc":"2.0","method":"notifications/initialized"}));
        assert!(matches!(kind, Some(MessageKind::Notification { .. })));

        let null_id = classify(&json!({"id": null, "method":"notifications/cancelled"}));
        assert!(matches!(null_id, Some(MessageKind::Notification { .. })));
    }

    #[test]
    fn result_or_error_without_method_is_a_response() {
        let ok = classify(&json!({"jsonrpc":"2.0","id":7,"result":{}}));
        assert_eq!(ok, Some(MessageKind::Response { id: json!(7) }));

        let err = classify(&json!({"jsonrpc":"2.0","id":8,"error":{"code":1,"message":"x"}}));
        assert_eq!(err, Some(MessageKind::Response { id: json!(8) }));
    }

    #[test]
    fn unclassifiable_shapes() {
        assert_eq!(classify(&json!([{"id":1,"method":"ping"}])), None);
        assert_eq!(classify(&json!({"id": 1})), None);
        assert_eq!(classify(&json!("ping")), None);
    }

    #[test]
    fn error_body_includes_data_only_when_given() {
        let plain = error(&json!(1), METHOD_NOT_FOUND, "nope", None);
        assert!(plain["error"].get("data").is_none());

        let with = error(&Value::Null, INVALID_REQUEST, "bad", Some(json!({"k": 1})));
        assert_eq!(with["error"]["data"]["k"], 1);
        assert!(with["id"].is_null());
    }

    #[test]
    fn version_support() {
        assert!(is_supported_version(DEFAULT_PROTOCOL_VERSION));
        assert!(is_supported_version("2024-11-05"));
        assert!(!is_supported_version("1999-01-01"));
    }
}
