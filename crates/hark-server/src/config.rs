//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - Built-in defaults
//! - TOML configuration file (`--config`, or the first of the default paths)
//! - Environment variables (`HARK_*`, with `__` between nested keys,
//!   e.g. `HARK_PRESENCE__EVICT_DISPLACED=false`)

use anyhow::{Context, Result};
use hark_core::{HubConfig, MemoryUserStore, User};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Prefix of environment overrides.
const ENV_PREFIX: &str = "HARK";

/// Files searched when no config path is given.
const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "hark.toml",
    "/etc/hark/hark.toml",
    "~/.config/hark/hark.toml",
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

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Presence policy.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// User store configuration.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time in milliseconds after which a connection is dropped.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
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

/// Presence policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Close the older connection when a user registers twice.
    #[serde(default = "default_true")]
    pub evict_displaced: bool,

    /// Reply with an `error` event to status queries for unknown users.
    #[serde(default)]
    pub report_unknown_users: bool,
}

/// User store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Accept registrations from ids that have no record.
    #[serde(default = "default_true")]
    pub auto_admit: bool,

    /// Users known at startup.
    #[serde(default)]
    pub users: Vec<User>,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
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
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    25_000 // 25 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
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
            metrics: MetricsConfig::default(),
            presence: PresenceConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
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

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            evict_displaced: true,
            report_unknown_users: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            auto_admit: true,
            users: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Reads `path` if given, otherwise the first existing default path, then
    /// applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or a value has the
    /// wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        let file = path.map(Path::to_path_buf).or_else(find_default_config);
        if let Some(file) = &file {
            tracing::info!("Loading configuration from {}", file.display());
            builder = builder.add_source(::config::File::from(file.as_path()));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Hub settings derived from the presence policy.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            evict_displaced: self.presence.evict_displaced,
            report_unknown_users: self.presence.report_unknown_users,
        }
    }

    /// Build the user store described by the `[store]` section.
    #[must_use]
    pub fn user_store(&self) -> MemoryUserStore {
        let store = if self.store.auto_admit {
            MemoryUserStore::auto_admit()
        } else {
            MemoryUserStore::new()
        };
        for user in &self.store.users {
            store.insert(user.clone());
        }
        store
    }
}

fn find_default_config() -> Option<PathBuf> {
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}
