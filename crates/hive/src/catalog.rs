//! Content catalog: remote modules, global patterns and device defaults.
//!
//! The catalog is a TOML file edited by operators. Reloading swaps the
//! whole snapshot; nothing reads a half-applied catalog.
//!
//! ```toml
//! [[modules]]
//! module_id = "OPENMOXIE_CHAT"
//! content_id = "default"
//! opener = "Hi there!|Hello!"
//! prompt = "You are a friendly robot."
//!
//! [[global_responses]]
//! name = "time"
//! action = "method"
//! pattern = "^what time is it"
//! sort_key = 10
//! code = '''
//! function get_response(request, response, entities)
//!   return "It is " .. os.date("%I:%M %p")
//! end
//! '''
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::sessions::chat::ChatParams;
use crate::sessions::SessionKey;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read content catalog {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse content catalog {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid pattern for global response {name}: {source}")]
    Pattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// How a global pattern responds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Response,
    Launch,
    ConfirmLaunch,
    Method,
}

/// One global response as written in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalResponseSpec {
    pub name: String,
    pub action: PatternKind,
    pub pattern: String,
    /// Higher wins.
    #[serde(default)]
    pub sort_key: i64,
    #[serde(default)]
    pub response_text: String,
    #[serde(default)]
    pub response_markup: String,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub content_id: Option<String>,
    /// Capture group indices copied into `local_data.entities`.
    #[serde(default)]
    pub entity_groups: Vec<usize>,
    #[serde(default)]
    pub code: Option<String>,
}

/// One remote module/content pair served by a chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub module_id: String,
    pub content_id: String,
    #[serde(flatten)]
    pub chat: ChatParams,
}

impl ModuleSpec {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.module_id, &self.content_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentCatalog {
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,

    #[serde(default)]
    pub global_responses: Vec<GlobalResponseSpec>,

    /// Schedule handed to devices that ask for one.
    #[serde(default = "ContentCatalog::default_schedule")]
    pub schedule: Value,

    /// Config pushed to every device on connect.
    #[serde(default = "ContentCatalog::default_device_config")]
    pub device_config: Value,
}

impl ContentCatalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, CatalogError> {
        let catalog: Self = toml::from_str(contents).map_err(|e| CatalogError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(catalog)
    }

    /// The catalog used when no content file exists: one open chat module
    /// and no global responses.
    pub fn builtin() -> Self {
        Self {
            modules: vec![ModuleSpec {
                module_id: "OPENMOXIE_CHAT".to_string(),
                content_id: "default".to_string(),
                chat: ChatParams::default(),
            }],
            global_responses: Vec::new(),
            schedule: Self::default_schedule(),
            device_config: Self::default_device_config(),
        }
    }

    /// Module ids with their content ids, in catalog order.
    pub fn module_content_ids(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for module in &self.modules {
            grouped
                .entry(module.module_id.clone())
                .or_default()
                .push(module.content_id.clone());
        }
        grouped
    }

    fn default_schedule() -> Value {
        serde_json::json!({
            "provided_schedule": [],
            "chat_request": {"module_id": "OPENMOXIE_CHAT", "content_id": "default"},
        })
    }

    fn default_device_config() -> Value {
        serde_json::json!({
            "paired_status": "paired",
            "audio_volume": "0.6",
            "screen_brightness": "1.0",
            "audio_wake_set": "off",
        })
    }
}

impl Default for ContentCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
