//! Deployment Directory: read-only routing facts for each deployment.
//!
//! The gateway never writes here. Records are created and mutated by the
//! provisioning workflow; the gateway reads one on every call to learn the
//! hosting mode, machine id, access token and capability manifest.
//!
//! Two adapters:
//! - [`MemoryDirectory`]: in-process map, optionally seeded from a JSON file
//!   (local development and tests).
//! - [`postgres::PgDirectory`]: reads the `deployments` table.

pub mod postgres;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::bridge::local::LaunchConfig;

/// Where a deployment's backend runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum HostingMode {
    /// Child process spawned by this gateway.
    Local,
    /// Machine on the hosting platform's private network.
    Remote { machine_id: String },
    /// Nothing provisioned yet.
    Unprovisioned,
}

/// Tool / resource / prompt descriptors the backend exposes. Descriptors are
/// opaque JSON and are returned to callers unmodified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub resources: Vec<Value>,
    #[serde(default)]
    pub prompts: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub hosting: HostingMode,
    /// Opaque bearer secret callers must present.
    pub access_token: String,
    #[serde(default)]
    pub manifest: CapabilityManifest,
    /// How to launch the backend when hosting is `local`.
    #[serde(default)]
    pub launch: Option<LaunchConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory query failed: {0}")]
    Query(String),
    #[error("failed to load deployments file {path}: {reason}")]
    Seed { path: String, reason: String },
}

#[async_trait]
pub trait DeploymentDirectory: Send + Sync {
    /// Look up a deployment by id. `Ok(None)` means "no such deployment".
    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>, DirectoryError>;
}

// ── In-memory adapter ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryDirectory {
    deployments: RwLock<HashMap<String, Deployment>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deployments(deployments: impl IntoIterator<Item = Deployment>) -> Self {
        let map = deployments
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        Self {
            deployments: RwLock::new(map),
        }
    }

    /// Seed from a JSON array of deployment records.
    pub async fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        let seed_err = |reason: String| DirectoryError::Seed {
            path: path.display().to_string(),
            reason,
        };
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| seed_err(e.to_string()))?;
        let records: Vec<Deployment> =
            serde_json::from_str(&raw).map_err(|e| seed_err(e.to_string()))?;
        tracing::info!(
            "directory: loaded {} deployment(s) from {}",
            records.len(),
            path.display()
        );
        Ok(Self::with_deployments(records))
    }

    pub async fn insert(&self, deployment: Deployment) {
        self.deployments
            .write()
            .await
            .insert(deployment.id.clone(), deployment);
    }
}

#[async_trait]
impl DeploymentDirectory for MemoryDirectory {
    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>, DirectoryError> {
        Ok(self.deployments.read().await.get(deployment_id).cloned())
    }
}
