// Event hub: per-deployment push channel.
//
// Backends publish server-initiated messages here; every open event channel
// for that deployment holds a broadcast receiver. A message raised while a
// call is in flight is addressed to the session that made the call and only
// reaches channels opened under that session. Unaddressed messages reach
// every channel. Publishing with no listeners simply drops the message.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// One server-initiated message and the session it belongs to, if any.
#[derive(Debug, Clone)]
pub struct Pushed {
    pub session_id: Option<String>,
    pub message: Value,
}

impl Pushed {
    /// Whether a channel opened under `session_id` should see this message.
    pub fn visible_to(&self, session_id: Option<&str>) -> bool {
        match &self.session_id {
            None => true,
            Some(target) => session_id == Some(target.as_str()),
        }
    }
}

pub struct EventHub {
    channels: RwLock<HashMap<String, broadcast::Sender<Pushed>>>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Returns how many channels of the deployment received the message
    /// (before session filtering).
    pub fn publish(&self, deployment_id: &str, session_id: Option<&str>, message: Value) -> usize {
        let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
        let pushed = Pushed {
            session_id: session_id.map(str::to_string),
            message,
        };
        match channels.get(deployment_id) {
            Some(tx) => tx.send(pushed).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscribe(&self, deployment_id: &str) -> broadcast::Receiver<Pushed> {
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        channels
            .entry(deployment_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop channels nobody listens to. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }

    pub fn listener_count(&self, deployment_id: &str) -> usize {
        let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
        channels
            .get(deployment_id)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscribers_of_that_deployment_only() {
        let hub = EventHub::default();
        let mut a = hub.subscribe("a");
        let mut b = hub.subscribe("b");

        assert_eq!(hub.publish("a", None, json!({"method": "notifications/progress"})), 1);

        let got = a.recv().await.unwrap();
        assert_eq!(got.message["method"], "notifications/progress");
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn publish_without_listeners_is_dropped() {
        let hub = EventHub::default();
        assert_eq!(hub.publish("nobody", None, json!({})), 0);
    }

    #[test]
    fn addressed_messages_are_visible_to_their_session_only() {
        let addressed = Pushed {
            session_id: Some("s1".into()),
            message: json!({"id": "r1", "method": "sampling/createMessage"}),
        };
        assert!(addressed.visible_to(Some("s1")));
        assert!(!addressed.visible_to(Some("s2")));
        assert!(!addressed.visible_to(None));

        let broadcast = Pushed {
            session_id: None,
            message: json!({"method": "notifications/tools/list_changed"}),
        };
        assert!(broadcast.visible_to(Some("s2")));
        assert!(broadcast.visible_to(None));
    }

    #[test]
    fn prune_removes_abandoned_channels() {
        let hub = EventHub::default();
        let rx = hub.subscribe("a");
        let _keep = hub.subscribe("b");
        drop(rx);

        assert_eq!(hub.prune(), 1);
        assert_eq!(hub.listener_count("a"), 0);
        assert_eq!(hub.listener_count("b"), 1);
    }
}
