// Catwalk gateway - runtime configuration
//
// Everything is read from the environment (optionally seeded by `.env`).
// Unset variables fall back to defaults; malformed values abort startup.

use std::path::PathBuf;
use std::time::Duration;

/// Which stdio driver the local bridge uses to talk to child processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Pick by platform capability at startup.
    Auto,
    /// Native async pipes (tokio process I/O).
    Async,
    /// Blocking pipes serviced by dedicated worker threads.
    Threaded,
}

impl StdioMode {
    /// Resolve `Auto` to a concrete driver for the current platform.
    pub fn resolve(self) -> Self {
        match self {
            StdioMode::Auto if cfg!(windows) => StdioMode::Threaded,
            StdioMode::Auto => StdioMode::Async,
            other => other,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for the remote machine bridge.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub app_name: String,
    pub api_token: Option<String>,
    pub machines_api: String,
    /// DNS suffix appended to the machine id (`<machine-id>.<private_domain>`).
    pub private_domain: String,
    pub machine_port: u16,
    pub path: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl RemoteSettings {
    pub fn for_app(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            api_token: None,
            machines_api: "https://api.machines.dev/v1".to_string(),
            private_domain: format!("vm.{app_name}.internal"),
            machine_port: 8080,
            path: "/mcp".to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Settings for the local process bridge.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub invoke_timeout: Duration,
    pub stop_grace: Duration,
    pub stdio_mode: StdioMode,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            stdio_mode: StdioMode::Auto,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub public_url: Option<String>,
    pub database_url: Option<String>,
    pub deployments_file: Option<PathBuf>,
    pub keepalive: Duration,
    pub legacy_keepalive: Duration,
    /// Answer 401 instead of 404 for unknown deployments.
    pub conceal_unknown_deployments: bool,
    pub local: LocalSettings,
    pub remote: RemoteSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            public_url: None,
            database_url: None,
            deployments_file: None,
            keepalive: Duration::from_secs(30),
            legacy_keepalive: Duration::from_secs(15),
            conceal_unknown_deployments: false,
            local: LocalSettings::default(),
            remote: RemoteSettings::for_app("catwalk-live-mcp-servers"),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(v) = get("PORT") {
            cfg.port = parse_num("PORT", &v)?;
        }
        cfg.public_url = get("PUBLIC_URL").map(|u| u.trim_end_matches('/').to_string());
        cfg.database_url = get("DATABASE_URL");
        cfg.deployments_file = get("DEPLOYMENTS_FILE").map(PathBuf::from);

        if let Some(v) = get("MCP_KEEPALIVE_SECS") {
            cfg.keepalive = secs("MCP_KEEPALIVE_SECS", &v)?;
        }
        if let Some(v) = get("MCP_LEGACY_KEEPALIVE_SECS") {
            cfg.legacy_keepalive = secs("MCP_LEGACY_KEEPALIVE_SECS", &v)?;
        }
        if let Some(v) = get("MCP_CONCEAL_UNKNOWN_DEPLOYMENTS") {
            cfg.conceal_unknown_deployments = parse_bool("MCP_CONCEAL_UNKNOWN_DEPLOYMENTS", &v)?;
        }

        // ── Local bridge ───────────────────────────────────────────────
        if let Some(v) = get("MCP_INVOKE_TIMEOUT_SECS") {
            cfg.local.invoke_timeout = secs("MCP_INVOKE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("MCP_STOP_GRACE_SECS") {
            cfg.local.stop_grace = secs("MCP_STOP_GRACE_SECS", &v)?;
        }
        if let Some(v) = get("MCP_STDIO_MODE") {
            cfg.local.stdio_mode = match v.to_ascii_lowercase().as_str() {
                "auto" => StdioMode::Auto,
                "async" => StdioMode::Async,
                "threaded" => StdioMode::Threaded,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "MCP_STDIO_MODE",
                        value: v,
                        reason: "expected auto, async or threaded".to_string(),
                    });
                }
            };
        }

        // ── Remote bridge ──────────────────────────────────────────────
        let app_name = get("FLY_MCP_APP_NAME").unwrap_or_else(|| cfg.remote.app_name.clone());
        let mut remote = RemoteSettings::for_app(&app_name);
        remote.api_token = get("FLY_API_TOKEN");
        if let Some(v) = get("FLY_MACHINES_API") {
            remote.machines_api = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("MCP_PRIVATE_DOMAIN") {
            remote.private_domain = v.trim_matches('.').to_string();
        }
        if let Some(v) = get("MCP_MACHINE_PORT") {
            remote.machine_port = parse_num("MCP_MACHINE_PORT", &v)?;
        }
        if let Some(v) = get("MCP_REMOTE_TIMEOUT_SECS") {
            remote.request_timeout = secs("MCP_REMOTE_TIMEOUT_SECS", &v)?;
        }
        cfg.remote = remote;

        Ok(cfg)
    }
}

fn parse_num<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let n: u64 = parse_num(var, value)?;
    if n == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(n))
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.local.invoke_timeout, Duration::from_secs(30));
        assert_eq!(cfg.local.stop_grace, Duration::from_secs(5));
        assert_eq!(cfg.remote.machine_port, 8080);
        assert_eq!(cfg.remote.path, "/mcp");
        assert_eq!(cfg.remote.private_domain, "vm.catwalk-live-mcp-servers.internal");
        assert!(!cfg.conceal_unknown_deployments);
    }

    #[test]
    fn private_domain_follows_app_name() {
        let cfg = load(&[("FLY_MCP_APP_NAME", "my-mcp")]).unwrap();
        assert_eq!(cfg.remote.private_domain, "vm.my-mcp.internal");
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = load(&[
            ("PORT", "9001"),
            ("MCP_STDIO_MODE", "Threaded"),
            ("MCP_INVOKE_TIMEOUT_SECS", "3"),
            ("PUBLIC_URL", "https://gw.example.com/"),
            ("MCP_CONCEAL_UNKNOWN_DEPLOYMENTS", "yes"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.local.stdio_mode, StdioMode::Threaded);
        assert_eq!(cfg.local.invoke_timeout, Duration::from_secs(3));
        assert_eq!(cfg.public_url.as_deref(), Some("https://gw.example.com"));
        assert!(cfg.conceal_unknown_deployments);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = load(&[("MCP_MACHINE_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("MCP_MACHINE_PORT"));

        let err = load(&[("MCP_STDIO_MODE", "fibers")]).unwrap_err();
        assert!(err.to_string().contains("MCP_STDIO_MODE"));

        let err = load(&[("MCP_KEEPALIVE_SECS", "0")]).unwrap_err();
        assert!(err.to_string().contains("at least 1 second"));
    }

    #[test]
    fn auto_mode_resolves_to_concrete_driver() {
        let resolved = StdioMode::Auto.resolve();
        assert_ne!(resolved, StdioMode::Auto);
        assert_eq!(StdioMode::Threaded.resolve(), StdioMode::Threaded);
    }
}
