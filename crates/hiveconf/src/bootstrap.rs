//! Bootstrap configuration - initial values that seed runtime state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    /// License values handed to devices on request, keyed by license type
    /// (e.g. `google_speech`).
    #[serde(default)]
    pub licenses: BTreeMap<String, String>,
}

/// Sizes of the bounded worker pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Concurrent remote-chat volleys and global commands.
    /// Default: 5
    #[serde(default = "WorkersConfig::default_pool")]
    pub remote_chat: usize,

    /// Concurrent service tasks (connect bootstrap, data queries).
    /// Default: 5
    #[serde(default = "WorkersConfig::default_pool")]
    pub service: usize,

    /// Concurrent transcriptions.
    /// Default: 5
    #[serde(default = "WorkersConfig::default_pool")]
    pub stt: usize,

    /// Pending remote-chat requests buffered per device.
    /// Default: 32
    #[serde(default = "WorkersConfig::default_mailbox_depth")]
    pub mailbox_depth: usize,
}

impl WorkersConfig {
    fn default_pool() -> usize {
        5
    }

    fn default_mailbox_depth() -> usize {
        32
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            remote_chat: Self::default_pool(),
            service: Self::default_pool(),
            stt: Self::default_pool(),
            mailbox_depth: Self::default_mailbox_depth(),
        }
    }
}

/// Timeouts and delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Wall-clock limit for custom global-command code.
    /// Default: 10000
    #[serde(default = "DefaultsConfig::default_method_timeout_ms")]
    pub method_timeout_ms: u64,

    /// Wall-clock limit for session script hooks.
    /// Default: 10000
    #[serde(default = "DefaultsConfig::default_method_timeout_ms")]
    pub hook_timeout_ms: u64,

    /// Memory one script VM may allocate, in MiB.
    /// Default: 64
    #[serde(default = "DefaultsConfig::default_script_memory_mb")]
    pub script_memory_mb: usize,

    /// Pause between device connect and the initial config push.
    /// Default: 1000
    #[serde(default = "DefaultsConfig::default_connect_settle_ms")]
    pub connect_settle_ms: u64,

    /// Interval for logging broker client metrics (0 disables).
    /// Default: 60
    #[serde(default = "DefaultsConfig::default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

impl DefaultsConfig {
    fn default_method_timeout_ms() -> u64 {
        10_000
    }

    fn default_script_memory_mb() -> usize {
        64
    }

    fn default_connect_settle_ms() -> u64 {
        1_000
    }

    fn default_metrics_interval_secs() -> u64 {
        60
    }

    pub fn method_timeout(&self) -> Duration {
        Duration::from_millis(self.method_timeout_ms)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }

    pub fn script_memory_bytes(&self) -> usize {
        self.script_memory_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            method_timeout_ms: Self::default_method_timeout_ms(),
            hook_timeout_ms: Self::default_method_timeout_ms(),
            script_memory_mb: Self::default_script_memory_mb(),
            connect_settle_ms: Self::default_connect_settle_ms(),
            metrics_interval_secs: Self::default_metrics_interval_secs(),
        }
    }
}

/// External HTTP collaborators (completion and transcription).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Base URL of an OpenAI-compatible chat completion API.
    /// Default: https://api.openai.com
    #[serde(default = "ServicesConfig::default_openai_url")]
    pub llm_url: String,

    /// Model used when a module does not name one.
    /// Default: gpt-4o-mini
    #[serde(default = "ServicesConfig::default_llm_model")]
    pub llm_model: String,

    /// Base URL of an OpenAI-compatible transcription API.
    /// Default: https://api.openai.com
    #[serde(default = "ServicesConfig::default_openai_url")]
    pub asr_url: String,

    /// Transcription model.
    /// Default: whisper-1
    #[serde(default = "ServicesConfig::default_asr_model")]
    pub asr_model: String,

    /// API key for both services. Usually provided via `OPENAI_API_KEY`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
}

impl ServicesConfig {
    fn default_openai_url() -> String {
        "https://api.openai.com".to_string()
    }

    fn default_llm_model() -> String {
        "gpt-4o-mini".to_string()
    }

    fn default_asr_model() -> String {
        "whisper-1".to_string()
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            llm_url: Self::default_openai_url(),
            llm_model: Self::default_llm_model(),
            asr_url: Self::default_openai_url(),
            asr_model: Self::default_asr_model(),
            api_key: String::new(),
        }
    }
}
