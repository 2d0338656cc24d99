// Server-push event channels.
//
// A channel is one broadcast receiver from the EventHub plus axum's
// keep-alive timer. It holds no lock and no backend handle, so a caller
// disconnect just drops the stream; the backend keeps running.

use std::convert::Infallible;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::http::header::CACHE_CONTROL;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::Stream;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::events::Pushed;
use crate::jsonrpc::PROTOCOL_VERSION_HEADER;

/// Pushed backend messages visible to `session_id`, as `message` events.
fn hub_events(
    deployment_id: String,
    session_id: Option<String>,
    rx: broadcast::Receiver<Pushed>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(pushed) if pushed.visible_to(session_id.as_deref()) => Some(Ok(Event::default()
            .event("message")
            .data(pushed.message.to_string()))),
        Ok(_) => None,
        Err(e) => {
            // Slow reader; the channel keeps going from the newest message.
            tracing::warn!(deployment_id = %deployment_id, "event channel: {}", e);
            None
        }
    })
}

/// Build the long-lived event-stream response.
///
/// `preamble` events are sent first (the legacy transport announces its
/// message endpoint this way). The stream ends when `shutdown` fires.
pub fn event_channel(
    deployment_id: &str,
    session_id: Option<String>,
    rx: broadcast::Receiver<Pushed>,
    preamble: Vec<Event>,
    keepalive: Duration,
    protocol_version: Option<&str>,
    shutdown: CancellationToken,
) -> Response {
    let stream = tokio_stream::iter(preamble.into_iter().map(Ok))
        .chain(hub_events(deployment_id.to_string(), session_id, rx));
    let stream = futures_util::StreamExt::take_until(stream, shutdown.cancelled_owned());

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keepalive).text("keep-alive"))
        .into_response();

    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Some(version) = protocol_version.and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(PROTOCOL_VERSION_HEADER, version);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push(session_id: Option<&str>, message: serde_json::Value) -> Pushed {
        Pushed {
            session_id: session_id.map(str::to_string),
            message,
        }
    }

    #[tokio::test]
    async fn headers_and_pushed_messages() {
        let (tx, rx) = broadcast::channel(8);
        let response = event_channel(
            "d1",
            None,
            rx,
            vec![Event::default().event("endpoint").data("/api/mcp/d1/messages")],
            Duration::from_secs(30),
            Some("2025-06-18"),
            CancellationToken::new(),
        );

        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(response.headers()["cache-control"], "no-store");
        assert_eq!(response.headers()["x-accel-buffering"], "no");
        assert_eq!(response.headers()["mcp-protocol-version"], "2025-06-18");

        tx.send(push(None, json!({"jsonrpc": "2.0", "method": "notifications/progress"})))
            .unwrap();

        let mut body = response.into_body().into_data_stream();
        let mut seen = String::new();
        while !seen.contains("notifications/progress") {
            let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(seen.starts_with("event: endpoint\ndata: /api/mcp/d1/messages\n\n"), "{seen}");
        assert!(seen.contains("event: message\n"), "{seen}");
    }

    #[tokio::test]
    async fn shutdown_ends_the_stream() {
        let (_tx, rx) = broadcast::channel::<Pushed>(8);
        let token = CancellationToken::new();
        let response = event_channel("d1", None, rx, Vec::new(), Duration::from_secs(30), None, token.clone());

        token.cancel();
        let bytes = tokio::time::timeout(
            Duration::from_secs(2),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn messages_for_other_sessions_are_skipped() {
        let (tx, rx) = broadcast::channel(8);
        let response = event_channel(
            "d1",
            Some("mine".into()),
            rx,
            Vec::new(),
            Duration::from_secs(30),
            None,
            CancellationToken::new(),
        );

        tx.send(push(Some("theirs"), json!({"id": "r1", "method": "sampling/createMessage"})))
            .unwrap();
        tx.send(push(Some("mine"), json!({"id": "r2", "method": "sampling/createMessage"})))
            .unwrap();

        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("\"r2\""), "{text}");
        assert!(!text.contains("\"r1\""), "{text}");
    }
}
