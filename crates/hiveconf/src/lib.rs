//! Configuration loading for Hive.
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things that cannot change while the
//!   service runs - paths, broker endpoints, telemetry.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial values that seed runtime
//!   state - worker pool sizes, timeouts, collaborator endpoints, licenses.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/hive/config.toml` (system)
//! 2. `~/.config/hive/config.toml` (user)
//! 3. `./hive.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`HIVE_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! content_file = "/etc/hive/content.toml"
//!
//! [broker]
//! events = "tcp://mqtt-bridge:5590"
//! commands = "tcp://mqtt-bridge:5591"
//!
//! [telemetry]
//! otlp_endpoint = "127.0.0.1:4317"
//!
//! [bootstrap.workers]
//! remote_chat = 8
//!
//! [bootstrap.defaults]
//! method_timeout_ms = 5000
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, DefaultsConfig, ServicesConfig, WorkersConfig};
pub use infra::{BrokerConfig, InfraConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid merged configuration: {0}")]
    Invalid(String),
}

/// Complete Hive configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HiveConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds runtime state.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl HiveConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/hive/config.toml`
    /// 3. `~/.config/hive/config.toml`
    /// 4. `./hive.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an explicit file replacing `./hive.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        Self::load_files(&files)
    }

    /// Merge the given files in order, then apply environment overrides.
    pub fn load_files(files: &[PathBuf]) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in files {
            let table = loader::load_table(path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path.clone());
        }

        let mut config = loader::from_table(merged)?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.infra.paths.state_dir =
            loader::expand_path(&config.infra.paths.state_dir.to_string_lossy());
        config.infra.paths.content_file =
            loader::expand_path(&config.infra.paths.content_file.to_string_lossy());

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# Hive Configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "state_dir = \"{}\"\n",
            self.infra.paths.state_dir.display()
        ));
        output.push_str(&format!(
            "content_file = \"{}\"\n",
            self.infra.paths.content_file.display()
        ));

        output.push_str("\n[broker]\n");
        output.push_str(&format!("events = \"{}\"\n", self.infra.broker.events));
        output.push_str(&format!("commands = \"{}\"\n", self.infra.broker.commands));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "otlp_endpoint = \"{}\"\n",
            self.infra.telemetry.otlp_endpoint
        ));
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));

        let workers = &self.bootstrap.workers;
        output.push_str("\n[bootstrap.workers]\n");
        output.push_str(&format!("remote_chat = {}\n", workers.remote_chat));
        output.push_str(&format!("service = {}\n", workers.service));
        output.push_str(&format!("stt = {}\n", workers.stt));
        output.push_str(&format!("mailbox_depth = {}\n", workers.mailbox_depth));

        let defaults = &self.bootstrap.defaults;
        output.push_str("\n[bootstrap.defaults]\n");
        output.push_str(&format!("method_timeout_ms = {}\n", defaults.method_timeout_ms));
        output.push_str(&format!("hook_timeout_ms = {}\n", defaults.hook_timeout_ms));
        output.push_str(&format!("script_memory_mb = {}\n", defaults.script_memory_mb));
        output.push_str(&format!("connect_settle_ms = {}\n", defaults.connect_settle_ms));
        output.push_str(&format!(
            "metrics_interval_secs = {}\n",
            defaults.metrics_interval_secs
        ));

        let services = &self.bootstrap.services;
        output.push_str("\n[bootstrap.services]\n");
        output.push_str(&format!("llm_url = \"{}\"\n", services.llm_url));
        output.push_str(&format!("llm_model = \"{}\"\n", services.llm_model));
        output.push_str(&format!("asr_url = \"{}\"\n", services.asr_url));
        output.push_str(&format!("asr_model = \"{}\"\n", services.asr_model));
        // api_key is never written back out

        if !self.bootstrap.licenses.is_empty() {
            output.push_str("\n[bootstrap.licenses]\n");
            for name in self.bootstrap.licenses.keys() {
                output.push_str(&format!("{} = \"<redacted>\"\n", name));
            }
        }

        output
    }
}
