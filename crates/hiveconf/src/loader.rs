//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, HiveConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli). Only returns files
/// that exist.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/hive/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("hive/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("hive.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read one config file as a raw TOML table.
///
/// The table is also checked against the config schema so that type errors
/// are reported against the file that introduced them.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    toml::Value::Table(table.clone())
        .try_into::<HiveConfig>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(table)
}

/// Deep-merge `overlay` into `base`. Nested tables merge key by key, every
/// other value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Build a config from a merged table, filling defaults for missing keys.
pub fn from_table(table: toml::Table) -> Result<HiveConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into::<HiveConfig>()
        .map_err(|e| ConfigError::Invalid(e.to_string()))
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut HiveConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

fn apply_overrides_from(
    config: &mut HiveConfig,
    sources: &mut ConfigSources,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let mut take = |key: &str| {
        let value = lookup(key)?;
        sources.env_overrides.push(key.to_string());
        Some(value)
    };

    if let Some(v) = take("HIVE_STATE_DIR") {
        config.infra.paths.state_dir = expand_path(&v);
    }
    if let Some(v) = take("HIVE_CONTENT_FILE") {
        config.infra.paths.content_file = expand_path(&v);
    }

    if let Some(v) = take("HIVE_BROKER_EVENTS") {
        config.infra.broker.events = v;
    }
    if let Some(v) = take("HIVE_BROKER_COMMANDS") {
        config.infra.broker.commands = v;
    }

    if let Some(v) = take("HIVE_OTLP_ENDPOINT") {
        config.infra.telemetry.otlp_endpoint = v;
    }
    // Also support standard OTEL env var
    if let Some(v) = take("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.infra.telemetry.otlp_endpoint = v;
    }
    if let Some(v) = take("HIVE_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
    }
    if let Some(v) = take("RUST_LOG") {
        config.infra.telemetry.log_level = v;
    }

    if let Some(v) = take("HIVE_METHOD_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.bootstrap.defaults.method_timeout_ms = ms;
        }
    }
    if let Some(v) = take("HIVE_SCRIPT_MEMORY_MB") {
        if let Ok(mb) = v.parse() {
            config.bootstrap.defaults.script_memory_mb = mb;
        }
    }

    if let Some(v) = take("HIVE_LLM_URL") {
        config.bootstrap.services.llm_url = v;
    }
    if let Some(v) = take("HIVE_ASR_URL") {
        config.bootstrap.services.asr_url = v;
    }
    if let Some(v) = take("OPENAI_API_KEY") {
        config.bootstrap.services.api_key = v;
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
