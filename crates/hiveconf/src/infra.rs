//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Infrastructure section of the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Filesystem paths for Hive state and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for runtime state.
    /// Default: ~/.local/share/hive
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,

    /// Content catalog with remote modules and global responses.
    /// Default: ./content.toml
    #[serde(default = "PathsConfig::default_content_file")]
    pub content_file: PathBuf,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/hive"))
            .unwrap_or_else(|| PathBuf::from(".local/share/hive"))
    }

    fn default_content_file() -> PathBuf {
        PathBuf::from("content.toml")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
            content_file: Self::default_content_file(),
        }
    }
}

/// Endpoints of the broker bridge that carries device topics.
///
/// The bridge republishes every device topic as a `[topic, payload]`
/// multipart message and accepts the same shape for outbound commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// ZMQ endpoint we SUB-connect to for inbound device topics.
    /// Default: tcp://127.0.0.1:5590
    #[serde(default = "BrokerConfig::default_events")]
    pub events: String,

    /// ZMQ endpoint we PUB-connect to for outbound device commands.
    /// Default: tcp://127.0.0.1:5591
    #[serde(default = "BrokerConfig::default_commands")]
    pub commands: String,
}

impl BrokerConfig {
    fn default_events() -> String {
        "tcp://127.0.0.1:5590".to_string()
    }

    fn default_commands() -> String {
        "tcp://127.0.0.1:5591".to_string()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            events: Self::default_events(),
            commands: Self::default_commands(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint for OpenTelemetry. Empty disables export.
    /// Default: "" (console logging only)
    #[serde(default)]
    pub otlp_endpoint: String,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn otlp_enabled(&self) -> bool {
        !self.otlp_endpoint.trim().is_empty()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: String::new(),
            log_level: Self::default_log_level(),
        }
    }
}
