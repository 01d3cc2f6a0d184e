//! Launch configuration for MCP servers.
//!
//! A [`McpServerConfig`] is built in code or loaded from a file. Two file
//! formats are understood:
//!
//! ```toml
//! [[servers]]
//! name = "demo"
//! command = "mcp-server-demo"
//! args = ["--verbose"]
//! env = [["JAVA_OPTS", "-Xmx256m"]]
//! timeout_secs = 10
//! ```
//!
//! and the `mcpServers` object of a Claude settings file:
//!
//! ```json
//! { "mcpServers": { "demo": { "command": "mcp-server-demo", "args": [] } } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{McpError, Result};

/// Default time to wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default settle delay after spawning before the process must still be alive.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Default time a server gets to exit after its stdin is closed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How to launch one stdio MCP server, and how long to wait on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpServerConfig {
    /// Used in logs and thread names.
    pub name: String,
    /// Executable, resolved through `PATH`.
    pub command: String,
    pub args: Vec<String>,
    /// Added to the inherited environment.
    pub env: Vec<(String, String)>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Deadline for each request made through the client façade.
    pub request_timeout: Duration,
    /// How long the process must survive after spawning.
    pub startup_grace: Duration,
    /// How long to wait for a graceful exit before killing.
    pub shutdown_grace: Duration,
}

impl McpServerConfig {
    /// Create a new server config.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            startup_grace: DEFAULT_STARTUP_GRACE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Replace the argument list.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Append one argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set a variable in the child's environment.
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run the child in `cwd`.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the startup settle delay.
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

fn default_enabled() -> bool {
    true
}

/// A server entry as written in a config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    pub name: String,
    /// Required; an empty command is rejected by [`to_config`](Self::to_config).
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// `[key, value]` pairs.
    #[serde(default)]
    pub env: Vec<[String; 2]>,
    pub cwd: Option<PathBuf>,
    /// Request timeout in seconds. Defaults to 10.
    pub timeout_secs: Option<u64>,
    /// Startup settle delay in milliseconds. Defaults to 500.
    pub startup_grace_ms: Option<u64>,
    /// Shutdown grace period in milliseconds. Defaults to 2000.
    pub shutdown_grace_ms: Option<u64>,
    /// Disabled entries are skipped by [`ServersFile::enabled_servers`].
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ServerEntry {
    /// Turn the entry into a launch configuration.
    pub fn to_config(&self) -> Result<McpServerConfig> {
        if self.command.trim().is_empty() {
            return Err(McpError::config(format!(
                "server '{}' has no command",
                self.name
            )));
        }

        let mut config = McpServerConfig::new(&self.name, &self.command)
            .with_args(self.args.clone());
        config.env = self
            .env
            .iter()
            .map(|[k, v]| (k.clone(), v.clone()))
            .collect();
        config.cwd = self.cwd.clone();
        if let Some(secs) = self.timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.startup_grace_ms {
            config.startup_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = self.shutdown_grace_ms {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

/// A set of server entries loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServersFile {
    /// Configured servers, in file order.
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

/// One entry of a Claude settings `mcpServers` object.
#[derive(Debug, Deserialize)]
struct ClaudeServer {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaudeSettings {
    #[serde(default)]
    mcp_servers: BTreeMap<String, ClaudeServer>,
}

impl ServersFile {
    /// Parse the TOML format.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| McpError::config(e.to_string()))
    }

    /// Parse a Claude settings JSON document. Servers come out sorted by name.
    pub fn from_claude_settings(json: &str) -> Result<Self> {
        let settings: ClaudeSettings = serde_json::from_str(json)
            .map_err(|e| McpError::config(format!("invalid settings JSON: {e}")))?;

        let servers = settings
            .mcp_servers
            .into_iter()
            .map(|(name, server)| ServerEntry {
                name,
                command: server.command,
                args: server.args,
                env: server.env.into_iter().map(|(k, v)| [k, v]).collect(),
                cwd: None,
                timeout_secs: None,
                startup_grace_ms: None,
                shutdown_grace_ms: None,
                enabled: !server.disabled,
            })
            .collect();
        Ok(Self { servers })
    }

    /// Load a file, choosing the format by extension: `.json` is a Claude
    /// settings file, anything else is TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            McpError::config(format!("failed to read '{}': {e}", path.display()))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let file = if is_json {
            Self::from_claude_settings(&content)?
        } else {
            Self::from_toml(&content)?
        };

        tracing::debug!(
            path = %path.display(),
            servers = file.servers.len(),
            "loaded MCP server config"
        );
        Ok(file)
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Launch configurations of every enabled entry.
    pub fn enabled_servers(&self) -> Result<Vec<McpServerConfig>> {
        self.servers
            .iter()
            .filter(|s| s.enabled)
            .map(ServerEntry::to_config)
            .collect()
    }
}

/// Location of the user's Claude settings file (`~/.claude/settings.json`).
pub fn claude_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("settings.json"))
}
