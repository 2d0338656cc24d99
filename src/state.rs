use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::bridge::BridgeError;
use crate::bridge::local::ProcessRegistry;
use crate::bridge::remote::RemoteBridge;
use crate::config::GatewayConfig;
use crate::directory::DeploymentDirectory;
use crate::events::EventHub;
use crate::session::SessionRegistry;

// ── AppState ────────────────────────────────────────────────────────────────
/// Central application state. Every store is owned here and injected at
/// construction, so tests can run isolated gateways side by side.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub directory: Arc<dyn DeploymentDirectory>,
    /// Local backends, at most one per deployment.
    pub processes: Arc<ProcessRegistry>,
    pub remote: Arc<RemoteBridge>,
    pub sessions: Arc<SessionRegistry>,
    /// Server-initiated messages waiting for an open event channel.
    pub events: Arc<EventHub>,
    pub start_time: Instant,
    /// `true` once the listener is bound.
    pub ready: Arc<AtomicBool>,
    /// Cancelled when shutdown begins; ends every open event channel so the
    /// server can drain.
    pub shutdown: CancellationToken,
}

// ── Readiness helpers ───────────────────────────────────────────────────────
impl AppState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("gateway marked as READY");
    }
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        directory: Arc<dyn DeploymentDirectory>,
    ) -> Result<Self, BridgeError> {
        let events = Arc::new(EventHub::default());
        let processes = Arc::new(ProcessRegistry::new(config.local.clone(), events.clone()));
        let remote = Arc::new(RemoteBridge::new(config.remote.clone())?);

        tracing::info!(
            "AppState initialised: remote app '{}', stdio mode {:?}",
            config.remote.app_name,
            config.local.stdio_mode.resolve()
        );

        Ok(Self {
            config: Arc::new(config),
            directory,
            processes,
            remote,
            sessions: Arc::new(SessionRegistry::new()),
            events,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        })
    }
}
