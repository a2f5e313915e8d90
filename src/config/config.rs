//! Configuration structures and loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::runtime::RuntimeKind;

/// Main configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Directory holding per-run state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory holding the route table.
    #[serde(default = "default_routes_dir")]
    pub routes_dir: PathBuf,

    /// Which container runtime to use.
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeKind,

    /// Image used when a run does not name one.
    #[serde(default = "default_image")]
    pub default_image: String,

    /// Egress firewall and credential proxy.
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// How long Stop waits for the exit monitor before proceeding.
    #[serde(default = "default_exit_wait_timeout")]
    pub exit_wait_timeout_secs: u64,

    /// Configured MCP servers.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            state_dir: default_state_dir(),
            routes_dir: default_routes_dir(),
            runtime: default_runtime(),
            default_image: default_image(),
            firewall: FirewallConfig::default(),
            exit_wait_timeout_secs: default_exit_wait_timeout(),
            mcp_servers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        // Resolve relative paths against the config file's parent directory.
        let base_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        config.resolve_paths(&base_dir);

        config.ensure_dirs()?;
        Ok(config)
    }

    /// Load the file if it exists, defaults otherwise.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.ensure_dirs()?;
            Ok(config)
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.state_dir.is_relative() {
            self.state_dir = base.join(&self.state_dir);
        }
        if self.routes_dir.is_relative() {
            self.routes_dir = base.join(&self.routes_dir);
        }
    }

    fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.routes_dir)?;
        Ok(())
    }
}

/// Egress firewall and credential proxy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallConfig {
    /// Restrict run egress to the credential proxy.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_proxy_host")]
    pub proxy_host: String,

    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_host: default_proxy_host(),
            proxy_port: default_proxy_port(),
            auth_token: None,
        }
    }
}

/// One configured MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub url: String,

    /// Auth spec naming the grant this server needs.
    #[serde(default)]
    pub auth: Option<McpAuth>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpAuth {
    pub grant: String,
}

fn moat_home() -> PathBuf {
    if let Ok(home) = std::env::var("MOAT_HOME") {
        return PathBuf::from(home);
    }
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(".moat"))
        .unwrap_or_else(|_| PathBuf::from(".moat"))
}

fn default_state_dir() -> PathBuf {
    moat_home().join("runs")
}

fn default_routes_dir() -> PathBuf {
    moat_home().join("routes")
}

fn default_runtime() -> RuntimeKind {
    RuntimeKind::Docker
}

fn default_image() -> String {
    "moat-agent:latest".to_string()
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    8642
}

fn default_exit_wait_timeout() -> u64 {
    30
}
