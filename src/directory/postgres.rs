// Postgres-backed deployment directory.
//
// Reads the provisioning workflow's `deployments` table. The MCP settings
// live in the `schedule_config` JSON column under `mcp_config`:
//
//   { "mcp_config": { "package": "...", "runtime": "node",
//                     "tools": [...], "resources": [...], "prompts": [...] } }
//
// Hosting mode is derived: a machine id means remote, a package means local,
// neither means unprovisioned. Credentials are injected by provisioning, not
// read here, so local launch configs come back without credentials.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::{CapabilityManifest, Deployment, DeploymentDirectory, DirectoryError, HostingMode};
use crate::bridge::local::{LaunchConfig, Runtime};

#[derive(Debug, sqlx::FromRow)]
pub struct DeploymentRow {
    pub id: Uuid,
    pub name: String,
    pub schedule_config: Option<sqlx::types::Json<Value>>,
    pub access_token: Option<String>,
    pub machine_id: Option<String>,
}

impl DeploymentRow {
    /// Convert to a routing record. Rows without an access token cannot be
    /// authenticated against and are treated as absent.
    pub fn into_deployment(self) -> Option<Deployment> {
        let access_token = self.access_token.filter(|t| !t.is_empty())?;
        let config = self
            .schedule_config
            .map(|j| j.0)
            .and_then(|v| v.get("mcp_config").cloned())
            .unwrap_or(Value::Null);

        let list = |key: &str| {
            config
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        let manifest = CapabilityManifest {
            tools: list("tools"),
            resources: list("resources"),
            prompts: list("prompts"),
        };

        let package = config
            .get("package")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .map(String::from);
        let runtime = config
            .get("runtime")
            .cloned()
            .and_then(|r| serde_json::from_value::<Runtime>(r).ok());

        let command = config
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(String::from);
        let args = list("args")
            .iter()
            .filter_map(|a| a.as_str().map(String::from))
            .collect::<Vec<_>>();
        let launchable = package.is_some() || command.is_some();

        let hosting = match &self.machine_id {
            Some(machine_id) if !machine_id.is_empty() => HostingMode::Remote {
                machine_id: machine_id.clone(),
            },
            _ if launchable => HostingMode::Local,
            _ => HostingMode::Unprovisioned,
        };

        let launch = launchable.then(|| LaunchConfig {
            package: package.unwrap_or_default(),
            runtime,
            command,
            args,
            credentials: Default::default(),
        });

        Some(Deployment {
            id: self.id.to_string(),
            name: self.name,
            hosting,
            access_token,
            manifest,
            launch,
        })
    }
}

pub struct PgDirectory {
    db: PgPool,
}

impl PgDirectory {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DeploymentDirectory for PgDirectory {
    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>, DirectoryError> {
        // Non-UUID ids can never match a row.
        let Ok(id) = Uuid::parse_str(deployment_id) else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, DeploymentRow>(
            "SELECT id, name, schedule_config, access_token, machine_id \
             FROM deployments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| DirectoryError::Query(e.to_string()))?;

        Ok(row.and_then(DeploymentRow::into_deployment))
    }
}
