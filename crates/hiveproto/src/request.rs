//! Inbound remote-chat requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtoError, Result};

/// What the device wants from the session it is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatCommand {
    /// Context update; never answered.
    Notify,
    /// Start (or restart) a conversation.
    Prompt,
    /// Next user turn.
    Continue,
    /// The user said nothing intelligible; ask again.
    Reprompt,
}

impl ChatCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatCommand::Notify => "notify",
            ChatCommand::Prompt => "prompt",
            ChatCommand::Continue => "continue",
            ChatCommand::Reprompt => "reprompt",
        }
    }
}

/// Additional context lines attached to a notify.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtraLine {
    #[serde(default)]
    pub context_type: String,
    #[serde(default)]
    pub text: String,
}

/// A module/content pair, used for launch targets and recommended exits.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

/// Where the device would like to go when the current module ends.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Recommend {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<Value>,
    #[serde(default)]
    pub exits: Vec<ModuleRef>,
}

/// One remote-chat request from a device. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub event_id: String,
    pub backend: String,
    pub command: ChatCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_lines: Vec<ExtraLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommend: Option<Recommend>,
}

impl DeviceRequest {
    /// Build a request as a device would send it for the given speech:
    /// `continue` with speech, or `prompt` without.
    pub fn from_speech(
        speech: Option<&str>,
        module_id: Option<&str>,
        content_id: Option<&str>,
    ) -> Self {
        let speech = speech.filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            backend: "router".to_string(),
            command: if speech.is_some() {
                ChatCommand::Continue
            } else {
                ChatCommand::Prompt
            },
            module_id: module_id.map(str::to_string),
            content_id: content_id.map(str::to_string),
            speech,
            extra_lines: Vec::new(),
            recommend: None,
        }
    }

    pub fn is_notify(&self) -> bool {
        self.command == ChatCommand::Notify
    }

    pub fn module_id(&self) -> &str {
        self.module_id.as_deref().unwrap_or_default()
    }

    pub fn content_id(&self) -> &str {
        self.content_id.as_deref().unwrap_or_default()
    }

    /// Speech or the empty string.
    pub fn speech(&self) -> &str {
        self.speech.as_deref().unwrap_or_default()
    }

    /// First recommended exit, if the device offered one.
    pub fn first_exit(&self) -> Option<&ModuleRef> {
        self.recommend.as_ref().and_then(|r| r.exits.first())
    }
}

/// Everything that can arrive on a `remote-chat` event topic.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChatEvent {
    /// `backend == "router"`: a conversational turn.
    Chat(DeviceRequest),
    /// `backend == "data"` asking for the remote module list.
    ModulesQuery { event_id: String },
    /// Anything else; logged and ignored.
    Unhandled { backend: String },
}

#[derive(Deserialize)]
struct Probe {
    #[serde(default)]
    backend: Option<String>,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    query: Option<Value>,
}

impl RemoteChatEvent {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: Value = serde_json::from_slice(payload)?;
        let probe: Probe =
            serde_json::from_value(raw.clone()).map_err(|e| ProtoError::MalformedRequest {
                event_id: None,
                reason: e.to_string(),
            })?;

        match probe.backend.as_deref() {
            Some("router") => serde_json::from_value(raw)
                .map(RemoteChatEvent::Chat)
                .map_err(|e| ProtoError::MalformedRequest {
                    event_id: probe.event_id,
                    reason: e.to_string(),
                }),
            Some("data")
                if probe
                    .query
                    .as_ref()
                    .and_then(|q| q.get("query"))
                    .and_then(Value::as_str)
                    == Some("modules") =>
            {
                Ok(RemoteChatEvent::ModulesQuery {
                    event_id: probe.event_id.unwrap_or_default(),
                })
            }
            other => Ok(RemoteChatEvent::Unhandled {
                backend: other.unwrap_or_default().to_string(),
            }),
        }
    }
}
