// Launch specs for locally hosted backends.
//
// A package identifier plus a runtime becomes a command line, unless the
// record names an explicit command. Stored credentials become the child's
// environment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Prefix carried by credential names in storage (`env_API_KEY` -> `API_KEY`).
pub const CREDENTIAL_PREFIX: &str = "env_";

/// Host variables a child may inherit. Everything else is cleared so the
/// gateway's own secrets never reach a third-party process.
pub const INHERITED_VARS: [&str; 9] = [
    "PATH",
    "HOME",
    "TMPDIR",
    "TEMP",
    "TMP",
    "SYSTEMROOT",
    "USERPROFILE",
    "APPDATA",
    "LANG",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// Run via the package runner: `npx -y <package>`.
    Node,
    /// Run as a module: `python -m <package>`.
    Python,
}

impl Runtime {
    /// Scoped (`@org/pkg`) or path-like names are npm packages.
    pub fn infer(package: &str) -> Self {
        if package.starts_with('@') || package.contains('/') {
            Runtime::Node
        } else {
            Runtime::Python
        }
    }
}

/// A concrete command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn for_package(package: &str, runtime: Runtime) -> Self {
        match runtime {
            Runtime::Node => Self::new("npx", ["-y", package]),
            Runtime::Python => Self::new("python", ["-m", package]),
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Launch configuration attached to a `local` deployment record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(default)]
    pub package: String,
    #[serde(default)]
    pub runtime: Option<Runtime>,
    /// Explicit program; when set, `package` and `runtime` are ignored.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Decrypted credential values keyed by their stored names.
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

impl LaunchConfig {
    pub fn launch_spec(&self) -> LaunchSpec {
        if let Some(command) = self.command.as_deref().filter(|c| !c.is_empty()) {
            return LaunchSpec::new(command, &self.args);
        }
        let runtime = self
            .runtime
            .unwrap_or_else(|| Runtime::infer(&self.package));
        LaunchSpec::for_package(&self.package, runtime)
    }

    pub fn environment(&self) -> BTreeMap<String, String> {
        credential_env(
            self.credentials
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }
}

/// Map stored credential names to process variable names, 1:1.
pub fn credential_env<'a>(
    stored: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> BTreeMap<String, String> {
    stored
        .into_iter()
        .map(|(name, value)| {
            let var = name.strip_prefix(CREDENTIAL_PREFIX).unwrap_or(name);
            (var.to_string(), value.to_string())
        })
        .collect()
}

/// Host variables to pass through, in allow-list order.
pub(crate) fn inherited_env() -> Vec<(String, String)> {
    INHERITED_VARS
        .iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
        .collect()
}
