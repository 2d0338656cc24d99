// Session registry
//
// Tracks per-caller protocol state across calls. Sessions are created by the
// handshake, never mutated afterwards, and live until process restart.
// TODO: idle expiry once session counts are observable in production.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub deployment_id: String,
    /// Fixed at creation.
    pub protocol_version: String,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh session and return its id.
    pub async fn create(&self, deployment_id: &str, protocol_version: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session {
            id: id.clone(),
            deployment_id: deployment_id.to_string(),
            protocol_version: protocol_version.to_string(),
        });
        self.sessions.write().await.insert(id.clone(), session);
        tracing::debug!(session_id = %id, deployment_id = %deployment_id, "session created");
        id
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
