//! Local Process Bridge: one child process per deployment.
//!
//! The wire protocol is not multiplexed over a single stdin/stdout pair, so
//! every call to a [`LocalProcessTarget`] holds its exclusion lock for the
//! whole write-then-read exchange. That makes each local backend a strict
//! concurrency-1 bottleneck. Waiting for the lock, writing the frame and
//! reading the answer all share one deadline.
//!
//! One-way messages skip the lock: the caller's answer to a server request
//! raised mid-call must reach the backend while that call is still open.
//! The driver's stdin mutex keeps their lines whole.
//!
//! A router task owns the read side: the one response matching the in-flight
//! call id completes that call; notifications and server-initiated requests
//! go to the [`EventHub`], addressed to the in-flight call's session; anything
//! else is dropped.

mod launch;
pub mod pipes;

pub use launch::{CREDENTIAL_PREFIX, LaunchConfig, LaunchSpec, Runtime, credential_env};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::time::Instant;

use self::pipes::{ChildIo, StdioDriver};
use super::BridgeError;
use crate::config::LocalSettings;
use crate::events::EventHub;
use crate::jsonrpc;

struct PendingCall {
    id: Value,
    session_id: Option<String>,
    reply: oneshot::Sender<Result<Value, BridgeError>>,
}

type PendingSlot = Arc<std::sync::Mutex<Option<PendingCall>>>;

pub struct LocalProcessTarget {
    deployment_id: String,
    io: Box<dyn ChildIo>,
    call_lock: Mutex<()>,
    pending: PendingSlot,
    alive: Arc<AtomicBool>,
    invoke_timeout: Duration,
}

impl LocalProcessTarget {
    fn spawn(
        deployment_id: &str,
        launch: &LaunchSpec,
        env: &BTreeMap<String, String>,
        driver: &dyn StdioDriver,
        events: Arc<EventHub>,
        invoke_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let io = driver.spawn(deployment_id, launch, env, tx)?;

        let pending: PendingSlot = Arc::new(std::sync::Mutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));

        tokio::spawn(route_output(
            deployment_id.to_string(),
            rx,
            pending.clone(),
            alive.clone(),
            events,
        ));

        Ok(Self {
            deployment_id: deployment_id.to_string(),
            io,
            call_lock: Mutex::new(()),
            pending,
            alive,
            invoke_timeout,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.io.pid()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<(), BridgeError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(BridgeError::Unavailable(format!(
                "backend process for deployment {} is not running",
                self.deployment_id
            )))
        }
    }

    /// Send one request and wait for its response. Messages the backend
    /// raises meanwhile are addressed to `session_id`.
    pub async fn invoke(
        &self,
        method: &str,
        params: Option<&Value>,
        call_id: &Value,
        session_id: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let deadline = Instant::now() + self.invoke_timeout;
        self.ensure_alive()?;
        let Ok(_exclusive) = tokio::time::timeout_at(deadline, self.call_lock.lock()).await else {
            tracing::warn!(
                deployment_id = %self.deployment_id,
                method = %method,
                "gave up waiting for the previous call to finish"
            );
            return Err(BridgeError::Timeout(self.invoke_timeout));
        };
        self.ensure_alive()?;

        let frame = jsonrpc::request(call_id, method, params);
        let line = serde_json::to_string(&frame).map_err(|e| BridgeError::Malformed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        *self.slot() = Some(PendingCall {
            id: call_id.clone(),
            session_id: session_id.map(str::to_string),
            reply: tx,
        });

        tracing::debug!(deployment_id = %self.deployment_id, method = %method, "local invoke");

        if let Err(e) = self.write_frame(line, deadline).await {
            self.slot().take();
            return Err(e);
        }

        let outcome = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => {
                tracing::warn!(
                    deployment_id = %self.deployment_id,
                    method = %method,
                    "backend did not answer within {}s",
                    self.invoke_timeout.as_secs()
                );
                Err(BridgeError::Timeout(self.invoke_timeout))
            }
        };
        // A timed-out call leaves its slot behind; clear it so a late answer
        // is treated as stale.
        self.slot().take();
        outcome
    }

    /// Write a message that expects no answer (notification or the caller's
    /// response to a server-initiated request). Never waits for the call lock.
    pub async fn deliver(&self, message: &Value) -> Result<(), BridgeError> {
        self.ensure_alive()?;
        let line = serde_json::to_string(message).map_err(|e| BridgeError::Malformed(e.to_string()))?;
        self.write_frame(line, Instant::now() + self.invoke_timeout).await
    }

    /// Write one frame before `deadline`. A frame cut off mid-write leaves
    /// stdin unusable, so an expired write marks the target dead.
    async fn write_frame(&self, line: String, deadline: Instant) -> Result<(), BridgeError> {
        match tokio::time::timeout_at(deadline, self.io.write_line(line)).await {
            Ok(result) => result,
            Err(_) => {
                self.alive.store(false, Ordering::Release);
                tracing::warn!(
                    deployment_id = %self.deployment_id,
                    "backend stopped reading stdin, marking it unavailable"
                );
                Err(BridgeError::Timeout(self.invoke_timeout))
            }
        }
    }

    async fn shutdown(&self, grace: Duration) {
        self.io.terminate(grace).await;
        self.alive.store(false, Ordering::Release);
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<PendingCall>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn route_output(
    deployment_id: String,
    mut lines: mpsc::UnboundedReceiver<String>,
    pending: PendingSlot,
    alive: Arc<AtomicBool>,
    events: Arc<EventHub>,
) {
    let take_pending = || pending.lock().unwrap_or_else(|p| p.into_inner()).take();

    while let Some(line) = lines.recv().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                match take_pending() {
                    Some(call) => {
                        let _ = call.reply.send(Err(BridgeError::Malformed(format!(
                            "{e}: {}",
                            truncate(trimmed, 200)
                        ))));
                    }
                    None => tracing::debug!(
                        deployment_id = %deployment_id,
                        "ignoring non-JSON stdout: {}",
                        truncate(trimmed, 200)
                    ),
                }
                continue;
            }
        };

        match jsonrpc::classify(&message) {
            Some(jsonrpc::MessageKind::Response { id }) => {
                let mut slot = pending.lock().unwrap_or_else(|p| p.into_inner());
                let matches = slot.as_ref().is_some_and(|call| call.id == id);
                if matches {
                    if let Some(call) = slot.take() {
                        let _ = call.reply.send(Ok(message));
                    }
                } else {
                    tracing::debug!(deployment_id = %deployment_id, id = %id, "dropping stale response");
                }
            }
            Some(_) => {
                let session_id = pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .as_ref()
                    .and_then(|call| call.session_id.clone());
                let delivered = events.publish(&deployment_id, session_id.as_deref(), message);
                tracing::debug!(
                    deployment_id = %deployment_id,
                    session_id = ?session_id,
                    listeners = delivered,
                    "server-initiated message"
                );
            }
            None => {
                tracing::debug!(deployment_id = %deployment_id, "ignoring unclassifiable backend message");
            }
        }
    }

    alive.store(false, Ordering::Release);
    tracing::warn!(deployment_id = %deployment_id, "backend process closed stdout");
    if let Some(call) = take_pending() {
        let _ = call.reply.send(Err(BridgeError::Closed));
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Owns every local backend, at most one per deployment.
pub struct ProcessRegistry {
    targets: RwLock<HashMap<String, Arc<LocalProcessTarget>>>,
    driver: Arc<dyn StdioDriver>,
    events: Arc<EventHub>,
    settings: LocalSettings,
}

impl ProcessRegistry {
    pub fn new(settings: LocalSettings, events: Arc<EventHub>) -> Self {
        let driver = pipes::driver_for(settings.stdio_mode);
        tracing::info!("local bridge: using {} stdio driver", driver.name());
        Self {
            targets: RwLock::new(HashMap::new()),
            driver,
            events,
            settings,
        }
    }

    /// Launch the backend for `deployment_id` unless a live one exists.
    ///
    /// The write lock is held across the spawn so concurrent first calls
    /// cannot both launch a process.
    pub async fn start(
        &self,
        deployment_id: &str,
        launch: &LaunchSpec,
        env: &BTreeMap<String, String>,
    ) -> Result<Arc<LocalProcessTarget>, BridgeError> {
        let mut targets = self.targets.write().await;
        if let Some(existing) = targets.get(deployment_id) {
            if existing.is_alive() {
                tracing::debug!(deployment_id = %deployment_id, "backend already running");
                return Ok(existing.clone());
            }
        }
        // A dead target may still own a hung process; reap it off the lock.
        if let Some(stale) = targets.remove(deployment_id) {
            let grace = self.settings.stop_grace;
            tokio::spawn(async move { stale.shutdown(grace).await });
        }

        tracing::info!(
            deployment_id = %deployment_id,
            command = %launch.display(),
            env_vars = ?env.keys().collect::<Vec<_>>(),
            "starting backend process"
        );

        let target = Arc::new(LocalProcessTarget::spawn(
            deployment_id,
            launch,
            env,
            self.driver.as_ref(),
            self.events.clone(),
            self.settings.invoke_timeout,
        )?);
        tracing::info!(deployment_id = %deployment_id, pid = ?target.pid(), "backend process started");

        targets.insert(deployment_id.to_string(), target.clone());
        Ok(target)
    }

    pub async fn get(&self, deployment_id: &str) -> Option<Arc<LocalProcessTarget>> {
        self.targets.read().await.get(deployment_id).cloned()
    }

    pub async fn invoke(
        &self,
        deployment_id: &str,
        method: &str,
        params: Option<&Value>,
        call_id: &Value,
    ) -> Result<Value, BridgeError> {
        let target = self.get(deployment_id).await.ok_or_else(|| {
            BridgeError::Unavailable(format!(
                "no backend process running for deployment {deployment_id}"
            ))
        })?;
        target.invoke(method, params, call_id, None).await
    }

    /// Gracefully stop and unregister. Unknown ids are a no-op.
    pub async fn stop(&self, deployment_id: &str) {
        let removed = self.targets.write().await.remove(deployment_id);
        if let Some(target) = removed {
            tracing::info!(deployment_id = %deployment_id, "stopping backend process");
            target.shutdown(self.settings.stop_grace).await;
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.targets.write().await.drain().collect();
        tracing::info!("stopping {} backend process(es)", drained.len());
        let grace = self.settings.stop_grace;
        futures_util::future::join_all(
            drained
                .iter()
                .map(|(_, target)| target.shutdown(grace)),
        )
        .await;
    }

    /// Unregister targets whose process has exited. Returns their ids.
    pub async fn reap_dead(&self) -> Vec<String> {
        let mut targets = self.targets.write().await;
        let dead: Vec<String> = targets
            .iter()
            .filter(|(_, t)| !t.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            targets.remove(id);
        }
        dead
    }

    pub async fn live_count(&self) -> usize {
        self.targets
            .read()
            .await
            .values()
            .filter(|t| t.is_alive())
            .count()
    }
}
