//! The response envelope sent back for every non-notify request.
//!
//! `response_actions[0]` is the primary directive for the device. The wire
//! form also carries a legacy `response_action` field that mirrors it; the
//! mirror is produced on serialization and never stored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::request::{DeviceRequest, ModuleRef};

/// The apology spoken when nothing could handle a request.
pub const FALLBACK_TEXT: &str = "I'm sorry. Can  you repeat that?";

/// What the device should do after speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Speak and stay in the current module. Omitted on the wire.
    #[default]
    Respond,
    Launch,
    LaunchIfConfirmed,
    ExitModule,
    Sleep,
    /// Call a named device function; may accompany a primary action.
    Execute,
}

impl ActionKind {
    pub fn is_respond(&self) -> bool {
        matches!(self, ActionKind::Respond)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Respond => "respond",
            ActionKind::Launch => "launch",
            ActionKind::LaunchIfConfirmed => "launch_if_confirmed",
            ActionKind::ExitModule => "exit_module",
            ActionKind::Sleep => "sleep",
            ActionKind::Execute => "execute",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputType {
    #[default]
    GlobalResponse,
    GlobalCommand,
    Fallback,
}

/// Device event subscription change attached to the primary action.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventSubscription {
    pub active: Vec<String>,
    #[serde(default)]
    pub clear: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseAction {
    #[serde(default, skip_serializing_if = "ActionKind::is_respond")]
    pub action: ActionKind,
    #[serde(default)]
    pub output_type: OutputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_subscription: Option<EventSubscription>,
}

impl ResponseAction {
    pub fn respond(output_type: OutputType) -> Self {
        Self {
            output_type,
            ..Default::default()
        }
    }

    pub fn new(
        action: ActionKind,
        module_id: Option<&str>,
        content_id: Option<&str>,
        output_type: OutputType,
    ) -> Self {
        let non_empty = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            action,
            output_type,
            module_id: non_empty(module_id),
            content_id: non_empty(content_id),
            ..Default::default()
        }
    }

    fn target_string(&self) -> String {
        match (&self.module_id, &self.content_id) {
            (Some(m), Some(c)) => format!("({m}/{c})"),
            (Some(m), None) => format!("({m})"),
            _ => "()".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Output {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markup: Option<String>,
}

impl Output {
    /// True when there is no markup to send, so it must be rendered.
    pub fn markup_missing(&self) -> bool {
        self.markup.as_deref().map_or(true, str::is_empty)
    }
}

/// Response to one remote-chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireResponse", from = "WireResponse")]
pub struct ResponseEnvelope {
    pub result: i32,
    pub event_id: String,
    pub backend: String,
    pub input_speech: Option<String>,
    pub output: Output,
    actions: Vec<ResponseAction>,
    pub fallback: bool,
}

impl ResponseEnvelope {
    /// Seed a response for `request`: echoes the event id, backend and input
    /// speech, and carries a single default RESPOND action.
    pub fn new_response(request: &DeviceRequest, output_type: OutputType) -> Self {
        Self {
            result: 0,
            event_id: request.event_id.clone(),
            backend: request.backend.clone(),
            input_speech: request.speech.clone(),
            output: Output::default(),
            actions: vec![ResponseAction::respond(output_type)],
            fallback: false,
        }
    }

    /// The static reply sent when no global pattern and no module handles a
    /// request.
    pub fn fallback(request: &DeviceRequest) -> Self {
        Self::fallback_for(&request.event_id, &request.backend, request.speech.clone())
    }

    pub fn fallback_for(event_id: &str, backend: &str, input_speech: Option<String>) -> Self {
        Self {
            result: 0,
            event_id: event_id.to_string(),
            backend: backend.to_string(),
            input_speech,
            output: Output {
                text: FALLBACK_TEXT.to_string(),
                markup: Some(FALLBACK_TEXT.to_string()),
            },
            actions: vec![ResponseAction::respond(OutputType::Fallback)],
            fallback: true,
        }
    }

    pub fn actions(&self) -> &[ResponseAction] {
        &self.actions
    }

    pub fn primary(&self) -> &ResponseAction {
        // `actions` is never empty; every constructor seeds one entry
        &self.actions[0]
    }

    fn primary_mut(&mut self) -> &mut ResponseAction {
        &mut self.actions[0]
    }

    /// Overwrite the text. Markup is only replaced when a non-empty one is
    /// given; the output type only touches the primary action.
    pub fn set_output(&mut self, text: &str, markup: Option<&str>, output_type: Option<OutputType>) {
        self.output.text = text.to_string();
        if let Some(markup) = markup.filter(|m| !m.is_empty()) {
            self.output.markup = Some(markup.to_string());
        }
        if let Some(output_type) = output_type {
            self.primary_mut().output_type = output_type;
        }
    }

    /// Set the primary directive. Non-EXECUTE kinds replace the whole list;
    /// EXECUTE appends unless only the seeded RESPOND is present.
    pub fn add_action(
        &mut self,
        kind: ActionKind,
        module_id: Option<&str>,
        content_id: Option<&str>,
        output_type: OutputType,
    ) {
        let action = ResponseAction::new(kind, module_id, content_id, output_type);
        if kind == ActionKind::Execute {
            self.push_action(action);
        } else {
            self.actions = vec![action];
        }
    }

    /// Append a device function call.
    pub fn add_execution_action(
        &mut self,
        function_id: &str,
        function_args: Option<Value>,
        output_type: OutputType,
    ) {
        let action = ResponseAction {
            action: ActionKind::Execute,
            output_type,
            function_id: Some(function_id.to_string()),
            function_args,
            ..Default::default()
        };
        self.push_action(action);
    }

    /// Appends after an existing directive, or replaces the seeded RESPOND.
    pub(crate) fn push_action(&mut self, action: ResponseAction) {
        if self.actions.len() == 1 && self.actions[0].action.is_respond() {
            self.actions[0] = action;
        } else {
            self.actions.push(action);
        }
    }

    /// LAUNCH to the first recommended exit, or EXIT_MODULE when the device
    /// offered none.
    pub fn add_launch_or_exit(&mut self, request: &DeviceRequest) {
        let action = launch_or_exit(request.first_exit());
        self.actions = vec![action];
    }

    pub(crate) fn push_launch_or_exit(&mut self, request: Option<&DeviceRequest>) {
        let action = launch_or_exit(request.and_then(DeviceRequest::first_exit));
        self.push_action(action);
    }

    pub fn update_output_type(&mut self, output_type: OutputType) {
        self.primary_mut().output_type = output_type;
    }

    pub fn update_subscriptions(&mut self, active: Vec<String>, clear: bool) {
        self.primary_mut().event_subscription = Some(EventSubscription { active, clear });
    }

    /// Text with a bracketed summary of the directives, for logs.
    pub fn debug_string(&self) -> String {
        let mut out = self.output.text.clone();
        for action in self.actions.iter().filter(|a| !a.action.is_respond()) {
            match action.action {
                ActionKind::Launch | ActionKind::LaunchIfConfirmed => {
                    out.push_str(&format!(
                        " [{} -> {}]",
                        action.action.as_str(),
                        action.target_string()
                    ));
                }
                ActionKind::Execute => {
                    let args = action
                        .function_args
                        .as_ref()
                        .map(Value::to_string)
                        .unwrap_or_default();
                    out.push_str(&format!(
                        " [execute -> ({}, {})]",
                        action.function_id.as_deref().unwrap_or_default(),
                        args
                    ));
                }
                kind => out.push_str(&format!(" [{}]", kind.as_str())),
            }
        }
        out
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "command": "remote_chat",
                "result": self.result,
                "event_id": self.event_id,
                "fallback": true,
                "output": {"text": FALLBACK_TEXT},
            })
        })
    }
}

fn launch_or_exit(exit: Option<&ModuleRef>) -> ResponseAction {
    match exit {
        Some(exit) => ResponseAction::new(
            ActionKind::Launch,
            exit.module_id.as_deref(),
            exit.content_id.as_deref(),
            OutputType::GlobalResponse,
        ),
        None => ResponseAction::new(ActionKind::ExitModule, None, None, OutputType::GlobalResponse),
    }
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    #[serde(default = "WireResponse::command")]
    command: String,
    #[serde(default)]
    result: i32,
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input_speech: Option<String>,
    #[serde(default)]
    output: Output,
    #[serde(default)]
    response_actions: Vec<ResponseAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_action: Option<ResponseAction>,
    #[serde(default)]
    fallback: bool,
}

impl WireResponse {
    fn command() -> String {
        "remote_chat".to_string()
    }
}

impl From<ResponseEnvelope> for WireResponse {
    fn from(env: ResponseEnvelope) -> Self {
        Self {
            command: Self::command(),
            result: env.result,
            event_id: env.event_id,
            backend: env.backend,
            input_speech: env.input_speech,
            output: env.output,
            response_action: env.actions.first().cloned(),
            response_actions: env.actions,
            fallback: env.fallback,
        }
    }
}

impl From<WireResponse> for ResponseEnvelope {
    fn from(wire: WireResponse) -> Self {
        let mut actions = wire.response_actions;
        if actions.is_empty() {
            actions.push(wire.response_action.unwrap_or_default());
        }
        Self {
            result: wire.result,
            event_id: wire.event_id,
            backend: wire.backend,
            input_speech: wire.input_speech,
            output: wire.output,
            actions,
            fallback: wire.fallback,
        }
    }
}
