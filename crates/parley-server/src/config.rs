//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - A TOML file (`--config <path>`, or the first of the default paths)
//! - Environment variables (`PARLEY_PORT`, `PARLEY_LIMITS__MAX_CONNECTIONS`, ...)

use anyhow::{Context, Result};
use parley_core::{HandlerConfig, HubConfig};
use parley_protocol::codec::{Encoding, MAX_EVENT_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Paths searched when no file is given explicitly.
pub const DEFAULT_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Call session configuration.
    #[serde(default)]
    pub calls: CallsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path prefix of the WebSocket endpoint; the user id follows it.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Outbound encoding when the client does not ask for one.
    #[serde(default)]
    pub default_encoding: Encoding,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Capacity of each connection's outbound queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Close connections silent for this long. 0 disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

/// Call session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// How long rejected and ended calls stay queryable.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// How often terminal calls are pruned.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    MAX_EVENT_SIZE
}

fn default_outbound_queue() -> usize {
    256
}

fn default_idle_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_retention() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            calls: CallsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            default_encoding: Encoding::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from a file and the environment.
    ///
    /// Uses `path` when given, otherwise the first existing default path,
    /// otherwise built-in defaults. `PARLEY_*` variables override the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// environment override has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path.map(Path::to_path_buf).or_else(Self::discover) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        base.with_env(environment())
    }

    fn discover() -> Option<PathBuf> {
        DEFAULT_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn with_env(self, env: ::config::Environment) -> Result<Self> {
        ::config::Config::builder()
            .add_source(::config::Config::try_from(&self)?)
            .add_source(env)
            .build()
            .and_then(|merged| merged.try_deserialize::<Config>())
            .context("Invalid environment override")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }

    /// Hub settings derived from the limits and call sections.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_capacity: self.limits.outbound_queue,
            retention: Duration::from_secs(self.calls.retention_secs),
        }
    }

    /// Per-connection loop settings.
    #[must_use]
    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            idle_timeout: (self.heartbeat.idle_timeout_ms > 0)
                .then(|| Duration::from_millis(self.heartbeat.idle_timeout_ms)),
        }
    }

    /// WebSocket routes: the configured path plus the chat and call aliases.
    #[must_use]
    pub fn websocket_routes(&self) -> Vec<String> {
        let prefix = self.transport.websocket_path.trim_end_matches('/');
        let mut routes = vec![format!("{}/:user_id", prefix)];
        for alias in ["/chat/ws/:user_id", "/call/signal/:user_id"] {
            if !routes.iter().any(|r| r == alias) {
                routes.push(alias.to_string());
            }
        }
        routes
    }
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix("PARLEY")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
