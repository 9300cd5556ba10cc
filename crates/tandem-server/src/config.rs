//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file (explicit path, or the first of the search paths)
//! - Environment variables (`TANDEM_*`, `__` between nested keys)
//! - Command line flags (`--host`, `--port`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Config files searched when no explicit path is given.
const SEARCH_PATHS: [&str; 3] = [
    "tandem.toml",
    "/etc/tandem/tandem.toml",
    "~/.config/tandem/tandem.toml",
];

/// Prefix for environment overrides, e.g. `TANDEM_PORT` or
/// `TANDEM_LIMITS__MAX_CONNECTIONS`.
const ENV_PREFIX: &str = "TANDEM";

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

    /// Feedback persistence.
    #[serde(default)]
    pub feedback: FeedbackConfig,
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
    /// Maximum number of live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum display name length in characters.
    #[serde(default = "default_max_name_chars")]
    pub max_name_chars: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
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

/// Feedback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Mount `POST /api/feedback`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JSON Lines file feedback is appended to. `~` is expanded.
    #[serde(default = "default_feedback_path")]
    pub path: String,
}

// Default value functions
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

fn default_max_message_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_max_name_chars() -> usize {
    tandem_core::DEFAULT_MAX_NAME_CHARS
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_feedback_path() -> String {
    "feedback.jsonl".to_string()
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
            feedback: FeedbackConfig::default(),
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
            max_name_chars: default_max_name_chars(),
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

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_feedback_path(),
        }
    }
}

impl Config {
    /// Load configuration from a file and the environment.
    ///
    /// With `path` set, that file must exist. Otherwise the search paths are
    /// tried in order and defaults are used if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or a value cannot be
    /// parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);

        Self::load_from(path, env)
    }

    fn load_from(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let file = match path {
            Some(path) => Some((path.to_path_buf(), true)),
            None => Self::find_config_file().map(|found| (found, false)),
        };

        let mut builder = config::Config::builder();
        if let Some((path, required)) = file {
            tracing::debug!("Using config file {}", path.display());
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(required),
            );
        }

        builder
            .add_source(env)
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// First existing file among the search paths.
    fn find_config_file() -> Option<PathBuf> {
        SEARCH_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
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

    /// Feedback file path with `~` expanded.
    #[must_use]
    pub fn feedback_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.feedback.path).as_ref())
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(Some(source))
    }

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tandem-{}-{}.toml", name, std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_name_chars, 32);
        assert!(config.feedback.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let config = Config {
            host: "not an address".to_string(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 500

            [feedback]
            path = "/var/lib/tandem/feedback.jsonl"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 500);
        assert_eq!(config.limits.max_message_size, 16 * 1024);
        assert_eq!(config.feedback.path, "/var/lib/tandem/feedback.jsonl");
    }

    #[test]
    fn test_env_overrides_file() {
        let path = write_temp(
            "env",
            r#"
                port = 9000

                [heartbeat]
                interval_ms = 1000
            "#,
        );

        let config = Config::load_from(
            Some(&path),
            env(&[
                ("TANDEM_PORT", "9100"),
                ("TANDEM_LIMITS__MAX_CONNECTIONS", "42"),
                ("TANDEM_METRICS__ENABLED", "false"),
            ]),
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.port, 9100);
        assert_eq!(config.heartbeat.interval_ms, 1000);
        assert_eq!(config.limits.max_connections, 42);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let missing = std::env::temp_dir().join("tandem-does-not-exist.toml");
        assert!(Config::load_from(Some(&missing), env(&[])).is_err());
    }

    #[test]
    fn test_toml_dump_parses_back() {
        let mut config = Config::default();
        config.heartbeat.timeout_ms = 5_000;

        let dumped = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&dumped).unwrap();
        assert_eq!(parsed.heartbeat.timeout_ms, 5_000);
        assert_eq!(parsed.transport.websocket_path, "/ws");
    }
}
