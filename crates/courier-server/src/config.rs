//! Server configuration.
//!
//! Configuration is assembled from:
//! - A TOML file (`courier.toml`, `/etc/courier/courier.toml`, `~/.config/courier/courier.toml`)
//! - Environment variables (`COURIER__PORT`, `COURIER__LIMITS__MAX_CONNECTIONS`, ...)
//!
//! Environment values override the file, which overrides the defaults.

use anyhow::{Context, Result};
use config::Environment;
use courier_core::HubConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "COURIER";

const CONFIG_PATHS: [&str; 3] = [
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
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
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time after which a silent connection is closed, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exporter port.
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
    10_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    90_000
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
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            outbox_capacity: default_outbox_capacity(),
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

impl Config {
    /// Load configuration from the first config file found, or defaults,
    /// then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let base = match find_config_file() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        base.with_env_overrides(Environment::with_prefix(ENV_PREFIX))
    }

    /// Load configuration from a specific file.
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

    /// Layer an environment source over this configuration.
    ///
    /// Nested keys are separated by `__`, so `COURIER__LIMITS__MAX_CONNECTIONS`
    /// sets `limits.max_connections`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be deserialized.
    pub fn with_env_overrides(self, env: Environment) -> Result<Self> {
        let merged = config::Config::builder()
            .add_source(
                config::Config::try_from(&self).context("Failed to serialize base config")?,
            )
            .add_source(env.separator("__").try_parsing(true))
            .build()
            .context("Failed to apply environment overrides")?;

        merged
            .try_deserialize()
            .context("Invalid environment override")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Idle timeout after which a silent connection is closed.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    /// Hub configuration derived from the limits section.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbox_capacity: self.limits.outbox_capacity,
            max_subscriptions_per_connection: self.limits.max_subscriptions_per_connection,
        }
    }
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(source))
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.hub_config().outbox_capacity, 256);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000
            outbox_capacity = 32
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.outbox_capacity, 32);
        assert_eq!(config.limits.max_message_size, 64 * 1024);
        assert_eq!(config.heartbeat.timeout_ms, 90_000);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let base: Config = toml::from_str("port = 9000").unwrap();
        let config = base
            .with_env_overrides(env(&[
                ("COURIER__PORT", "7000"),
                ("COURIER__LIMITS__MAX_CONNECTIONS", "12"),
                ("COURIER__TRANSPORT__WEBSOCKET_PATH", "/chat"),
            ]))
            .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.limits.max_connections, 12);
        assert_eq!(config.transport.websocket_path, "/chat");
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_env_override_with_bad_type() {
        let result = Config::default().with_env_overrides(env(&[("COURIER__PORT", "eighty")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_missing_file() {
        assert!(Config::from_file("/nonexistent/courier.toml").is_err());
    }
}
