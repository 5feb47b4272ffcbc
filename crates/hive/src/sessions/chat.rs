//! Single-prompt chat sessions.
//!
//! Each catalog module becomes a [`ChatSession`]: a system prompt, an opener
//! and a rolling history fed to a [`Completion`]. The device is the source
//! of truth for history. It reports what was actually said through `notify`
//! requests, so a `continue` only borrows the history for one inference.
//!
//! Modules can carry Lua hooks in `code`:
//!
//! | function                     | when                                   |
//! |------------------------------|----------------------------------------|
//! | `pre_process(volley, s)`     | before inference; truthy return ends the volley |
//! | `post_process(volley, s)`    | after the reply text is set            |
//! | `notify_handler(volley, s)`  | after a notify is folded into history  |
//! | `complete_handler(volley, s)`| once, when the device leaves the module |
//!
//! `volley` is `{request, response, local_data, config, state, persist}` and
//! edits to `response` and `local_data` are kept. `s` is a read-only view of
//! the session (`history`, `total_volleys`, `max_volleys`) plus
//! `s.summarize(opts)`, which asks the model for a summary of the history.
//! `opts` may set `prompt`, `model`, `max_tokens` and `append_transcript`.
//!
//! The system prompt is a Handlebars template rendered for every inference
//! with the same `volley` and `session` views, e.g.
//! `You are talking to {{volley.config.child_name}}.`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use handlebars::Handlebars;
use hiveproto::{ChatCommand, LocalData, Volley};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use super::completion::{ChatTurn, Completion, CompletionRequest, Role};
use super::{Session, SessionFactory, SessionKey};
use crate::catalog::ModuleSpec;
use crate::sandbox::{HostFn, Sandbox, SandboxError, ScriptCall};

/// Spoken when the completion collaborator fails.
pub const INFERENCE_FAILED_TEXT: &str = "Oh no.  I have run into a bug";

/// Summary instruction used when the caller gives none.
pub const DEFAULT_SUMMARY_PROMPT: &str = "Summarize the following conversation between the friendly \
     robot Moxie, and the user.  Keep the summary brief, but include any important details.";

const HOOK_NAMES: [&str; 4] = ["pre_process", "post_process", "notify_handler", "complete_handler"];

/// Chat parameters of one catalog module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatParams {
    /// System prompt.
    #[serde(default = "ChatParams::default_prompt")]
    pub prompt: String,

    /// Opening line; `|` separates alternatives picked at random.
    #[serde(default = "ChatParams::default_opener")]
    pub opener: String,

    /// Falls back to the configured default model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default = "ChatParams::default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "ChatParams::default_temperature")]
    pub temperature: f32,

    /// History turns kept for inference.
    #[serde(default = "ChatParams::default_max_history")]
    pub max_history: usize,

    /// Volleys before the session says its exit line and leaves.
    #[serde(default = "ChatParams::default_max_volleys")]
    pub max_volleys: u64,

    #[serde(default = "ChatParams::default_exit_line")]
    pub exit_line: String,

    /// Lua hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ChatParams {
    fn default_prompt() -> String {
        "You are a having a conversation with your friend. Make it interesting and keep the \
         conversation moving forward. Your utterances are around 30-40 words long. Ask only one \
         question per response and ask it at the end of your response."
            .to_string()
    }

    fn default_opener() -> String {
        "Hi there!  Welcome to Open Moxie chat!".to_string()
    }

    fn default_max_tokens() -> u32 {
        70
    }

    fn default_temperature() -> f32 {
        0.5
    }

    fn default_max_history() -> usize {
        20
    }

    fn default_max_volleys() -> u64 {
        9999
    }

    fn default_exit_line() -> String {
        "Well, that was fun.  Let's move on.".to_string()
    }
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            prompt: Self::default_prompt(),
            opener: Self::default_opener(),
            model: None,
            max_tokens: Self::default_max_tokens(),
            temperature: Self::default_temperature(),
            max_history: Self::default_max_history(),
            max_volleys: Self::default_max_volleys(),
            exit_line: Self::default_exit_line(),
            code: None,
        }
    }
}

/// Options for [`ChatSession::summarize`]. Unset fields fall back to the
/// session's own model and token limit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SummaryOptions {
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub max_tokens: Option<u32>,
    /// Append the history as a `Moxie:`/`user:` transcript.
    pub append_transcript: bool,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            model: None,
            prompt: None,
            max_tokens: None,
            append_transcript: true,
        }
    }
}

impl SummaryOptions {
    /// Options from a script: nothing, a bare prompt string, or a table.
    fn from_script(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::String(prompt) => Ok(Self {
                prompt: Some(prompt),
                ..Default::default()
            }),
            other => serde_json::from_value(other).map_err(|e| format!("bad options: {e}")),
        }
    }
}

/// What a summary needs from the session, detached so it can run from a
/// script thread.
#[derive(Clone)]
struct Summarizer {
    key: SessionKey,
    completion: Arc<dyn Completion>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    history: Vec<ChatTurn>,
}

impl Summarizer {
    async fn summarize(&self, options: &SummaryOptions) -> String {
        let mut prompt = options
            .prompt
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_SUMMARY_PROMPT.to_string());
        if options.append_transcript {
            prompt.push_str("\nTranscript:\n\n");
            prompt.push_str(&transcript(&self.history));
        }

        let request = CompletionRequest {
            model: options
                .model
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| self.model.clone()),
            messages: vec![ChatTurn::new(Role::User, prompt)],
            max_tokens: options.max_tokens.filter(|t| *t > 0).unwrap_or(self.max_tokens),
            temperature: self.temperature,
        };

        match self.completion.complete(&request).await {
            Ok(summary) => summary,
            Err(e) => {
                error!(session.key = %self.key, error = %e, "Error summarizing chat");
                format!("Error summarizing chat: {e}.")
            }
        }
    }
}

/// History as one line per turn, the robot's turns as `Moxie`.
fn transcript(history: &[ChatTurn]) -> String {
    history
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::Assistant => "Moxie",
                Role::User => "user",
                Role::System => "system",
            };
            format!("{speaker}: {}", turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Which hooks a module's code defines.
#[derive(Debug, Clone, Default)]
struct Hooks {
    code: String,
    defined: Vec<&'static str>,
}

impl Hooks {
    fn has(&self, name: &str) -> bool {
        self.defined.iter().any(|d| *d == name)
    }
}

pub struct ChatSession {
    key: SessionKey,
    params: ChatParams,
    model: String,
    history: Vec<ChatTurn>,
    total_volleys: u64,
    local_data: LocalData,
    hooks: Hooks,
    completion: Arc<dyn Completion>,
    sandbox: Arc<dyn Sandbox>,
    hook_timeout: Duration,
}

impl ChatSession {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn total_volleys(&self) -> u64 {
        self.total_volleys
    }

    fn overflow(&self) -> bool {
        self.total_volleys >= self.params.max_volleys
    }

    fn reset(&mut self) {
        self.history.clear();
        self.total_volleys = 0;
    }

    /// Add to the session's own history. Only these count as volleys.
    fn add_history(&mut self, role: Role, message: &str) {
        self.total_volleys += 1;
        push_turn(&mut self.history, role, message, self.params.max_history);
    }

    fn opener(&self) -> String {
        let choices: Vec<&str> = self.params.opener.split('|').collect();
        choices
            .choose(&mut rand::thread_rng())
            .map(|s| s.to_string())
            .unwrap_or_default()
    }

    /// The system prompt rendered for `volley`. A template that fails to
    /// render is used as written.
    fn system_prompt(&self, volley: &Volley) -> String {
        let source = &self.params.prompt;
        if !source.contains("{{") {
            return source.clone();
        }

        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(handlebars::no_escape);

        let data = json!({
            "volley": volley.to_json(),
            "session": self.session_view(),
        });
        match handlebars.render_template(source, &data) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(session.key = %self.key, error = %e, "Failed to render prompt template");
                source.clone()
            }
        }
    }

    /// Next line for `speech`, plus whether the session is out of volleys.
    async fn next_response(&self, speech: &str, system_prompt: String) -> (String, bool) {
        let overflow = self.overflow();

        let mut history = self.history.clone();
        push_turn(&mut history, Role::User, speech, self.params.max_history);

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatTurn::new(Role::System, system_prompt));
        messages.extend(history);

        let request = CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.params.max_tokens,
            temperature: self.params.temperature,
        };

        let mut text = match self.completion.complete(&request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(session.key = %self.key, error = %e, "Inference failed");
                INFERENCE_FAILED_TEXT.to_string()
            }
        };
        if overflow {
            text.push(' ');
            text.push_str(&self.params.exit_line);
        }
        (text, overflow)
    }

    fn summarizer(&self) -> Summarizer {
        Summarizer {
            key: self.key.clone(),
            completion: self.completion.clone(),
            model: self.model.clone(),
            max_tokens: self.params.max_tokens,
            temperature: self.params.temperature,
            history: self.history.clone(),
        }
    }

    /// Ask the model to summarize the conversation so far. Failures come
    /// back as an `Error summarizing chat` line.
    pub async fn summarize(&self, options: &SummaryOptions) -> String {
        self.summarizer().summarize(options).await
    }

    /// `session.summarize` for scripts. Runs on the script's thread and
    /// blocks it until the summary is back.
    fn summarize_method(&self) -> HostFn {
        let summarizer = self.summarizer();
        let runtime = tokio::runtime::Handle::current();
        Arc::new(move |options: Value| -> Result<Value, String> {
            let options = SummaryOptions::from_script(options)?;
            Ok(Value::String(runtime.block_on(summarizer.summarize(&options))))
        })
    }

    fn session_view(&self) -> Value {
        json!({
            "key": self.key.as_str(),
            "history": self.history,
            "total_volleys": self.total_volleys,
            "max_volleys": self.params.max_volleys,
        })
    }

    /// Run a hook against `volley`, keeping its edits. Returns whether the
    /// hook returned something truthy.
    async fn run_hook(&self, name: &str, volley: &mut Volley) -> Result<bool, SandboxError> {
        let call = ScriptCall::new(
            &self.hooks.code,
            name,
            vec![volley.to_json(), self.session_view()],
        )
        .with_method(1, "summarize", self.summarize_method());
        let output = self.sandbox.call(call, self.hook_timeout).await?;

        if let Some(edited) = output.args.first() {
            volley
                .apply_json(edited)
                .map_err(|e| SandboxError::Script(format!("{name} left an invalid volley: {e}")))?;
        }
        Ok(!output.is_falsy())
    }

    async fn volley_inner(&mut self, volley: &mut Volley) -> Result<(), SandboxError> {
        let command = volley.request.command;

        if command == ChatCommand::Prompt && !self.history.is_empty() {
            self.reset();
        }

        if self.hooks.has("pre_process") {
            debug!(session.key = %self.key, "Running volley pre-filter");
            if self.run_hook("pre_process", volley).await? {
                volley.ingest_action_tags();
                return Ok(());
            }
        }

        let (text, overflow) = if command == ChatCommand::Prompt
            || (command == ChatCommand::Reprompt && self.history.is_empty())
        {
            (self.opener(), self.overflow())
        } else {
            let speech = if command == ChatCommand::Reprompt {
                "hm"
            } else {
                volley.request.speech()
            };
            let system_prompt = self.system_prompt(volley);
            self.next_response(speech, system_prompt).await
        };

        volley.set_output(&text, None);
        if overflow {
            volley.add_launch_or_exit();
        }

        if self.hooks.has("post_process") {
            debug!(session.key = %self.key, "Running volley post-filter");
            self.run_hook("post_process", volley).await?;
        }

        volley.ingest_action_tags();
        Ok(())
    }
}

/// Append a turn, merging with the previous one when the role repeats, and
/// keep only the last `max` turns.
fn push_turn(history: &mut Vec<ChatTurn>, role: Role, message: &str, max: usize) {
    match history.last_mut() {
        Some(last) if last.role == role => {
            last.content.push(' ');
            last.content.push_str(message);
        }
        _ => {
            history.push(ChatTurn::new(role, message));
            if history.len() > max {
                let excess = history.len() - max;
                history.drain(..excess);
            }
        }
    }
}

#[async_trait]
impl Session for ChatSession {
    async fn ingest_notify(&mut self, volley: &Volley) {
        for line in &volley.request.extra_lines {
            if line.context_type == "input" {
                self.add_history(Role::User, &line.text);
            }
        }
        let speech = volley.request.speech();
        if !speech.is_empty() && !speech.contains("animation:") && !speech.contains("silent:") {
            self.add_history(Role::Assistant, speech);
        }

        if self.hooks.has("notify_handler") {
            let mut hooked = volley.clone();
            hooked.local_data = self.local_data.clone();
            match self.run_hook("notify_handler", &mut hooked).await {
                Ok(_) => self.local_data = hooked.local_data,
                Err(e) => error!(session.key = %self.key, error = %e, "Error running notify hook"),
            }
        }
    }

    async fn handle_volley(&mut self, volley: &mut Volley) {
        volley.local_data = self.local_data.clone();

        if let Err(e) = self.volley_inner(volley).await {
            error!(session.key = %self.key, error = %e, "Error handling volley");
            let text = format!("Error handling volley: {e}");
            volley.reset_response();
            volley.set_output(&text, Some(&text));
        }

        self.local_data = volley.local_data.clone();
    }

    fn has_complete_hook(&self) -> bool {
        self.hooks.has("complete_handler")
    }

    async fn complete_hook(&mut self, mut volley: Volley) {
        if let Err(e) = self.run_hook("complete_handler", &mut volley).await {
            error!(session.key = %self.key, error = %e, "Error running complete hook");
        }
    }

    fn local_data(&self) -> LocalData {
        self.local_data.clone()
    }
}

/// Builds [`ChatSession`]s from catalog modules.
pub struct ChatSessionFactory {
    completion: Arc<dyn Completion>,
    sandbox: Arc<dyn Sandbox>,
    default_model: String,
    hook_timeout: Duration,
}

impl ChatSessionFactory {
    pub fn new(
        completion: Arc<dyn Completion>,
        sandbox: Arc<dyn Sandbox>,
        default_model: &str,
        hook_timeout: Duration,
    ) -> Self {
        Self {
            completion,
            sandbox,
            default_model: default_model.to_string(),
            hook_timeout,
        }
    }

    /// Find the hooks `code` defines. Code that fails to load leaves the
    /// session without hooks.
    async fn load_hooks(&self, key: &SessionKey, code: Option<&str>) -> Hooks {
        let Some(code) = code.filter(|c| !c.trim().is_empty()) else {
            return Hooks::default();
        };

        let mut defined = Vec::new();
        for name in HOOK_NAMES {
            match self.sandbox.defines(code, name, self.hook_timeout).await {
                Ok(true) => defined.push(name),
                Ok(false) => {}
                Err(e) => {
                    error!(session.key = %key, error = %e, "Error loading code for chat session");
                    return Hooks::default();
                }
            }
        }
        Hooks {
            code: code.to_string(),
            defined,
        }
    }
}

#[async_trait]
impl SessionFactory for ChatSessionFactory {
    async fn create(&self, spec: &ModuleSpec) -> anyhow::Result<Box<dyn Session>> {
        let key = spec.key();
        let hooks = self.load_hooks(&key, spec.chat.code.as_deref()).await;
        let model = spec
            .chat
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        debug!(session.key = %key, hooks = ?hooks.defined, "Created chat session");
        Ok(Box::new(ChatSession {
            key,
            params: spec.chat.clone(),
            model,
            history: Vec::new(),
            total_volleys: 0,
            local_data: LocalData::new(),
            hooks,
            completion: self.completion.clone(),
            sandbox: self.sandbox.clone(),
            hook_timeout: self.hook_timeout,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LuaSandbox;
    use hiveproto::{ActionKind, DeviceRequest, ExtraLine, RobotSnapshot};
    use std::sync::Mutex;

    /// Replies with a fixed line and remembers every request.
    #[derive(Default)]
    struct ScriptedCompletion {
        reply: Option<String>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl Completion for ScriptedCompletion {
        async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no completion configured"))
        }
    }

    fn spec(chat: ChatParams) -> ModuleSpec {
        ModuleSpec {
            module_id: "OPENMOXIE_CHAT".to_string(),
            content_id: "default".to_string(),
            chat,
        }
    }

    async fn session(
        chat: ChatParams,
        reply: Option<&str>,
    ) -> (Box<dyn Session>, Arc<ScriptedCompletion>) {
        let completion = Arc::new(ScriptedCompletion {
            reply: reply.map(str::to_string),
            ..Default::default()
        });
        let factory = ChatSessionFactory::new(
            completion.clone(),
            Arc::new(LuaSandbox::new()),
            "gpt-test",
            Duration::from_secs(5),
        );
        (factory.create(&spec(chat)).await.unwrap(), completion)
    }

    fn volley(command: ChatCommand, speech: Option<&str>) -> Volley {
        let mut request = DeviceRequest::from_speech(speech, Some("OPENMOXIE_CHAT"), Some("default"));
        request.command = command;
        Volley::new(Some("d_1"), request)
    }

    fn notify(speech: &str, inputs: &[&str]) -> Volley {
        let mut v = volley(ChatCommand::Notify, Some(speech));
        v.request.extra_lines = inputs
            .iter()
            .map(|t| ExtraLine {
                context_type: "input".to_string(),
                text: t.to_string(),
            })
            .collect();
        v
    }

    #[tokio::test]
    async fn test_prompt_speaks_an_opener() {
        let chat = ChatParams {
            opener: "Hello!|Howdy!".to_string(),
            ..Default::default()
        };
        let (mut s, completion) = session(chat, Some("unused")).await;
        let mut v = volley(ChatCommand::Prompt, None);
        s.handle_volley(&mut v).await;

        assert!(["Hello!", "Howdy!"].contains(&v.response.output.text.as_str()));
        assert_eq!(v.response.primary().action, ActionKind::Respond);
        assert!(completion.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_continue_sends_prompt_history_and_speech() {
        let (mut s, completion) = session(ChatParams::default(), Some("Dragons are great.")).await;
        s.ingest_notify(&notify("Want to talk about dragons?", &[])).await;

        let mut v = volley(ChatCommand::Continue, Some("yes please"));
        s.handle_volley(&mut v).await;
        assert_eq!(v.response.output.text, "Dragons are great.");

        let seen = completion.seen.lock().unwrap();
        let messages = &seen[0].messages;
        assert_eq!(seen[0].model, "gpt-test");
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1], ChatTurn::new(Role::Assistant, "Want to talk about dragons?"));
        assert_eq!(messages[2], ChatTurn::new(Role::User, "yes please"));
    }

    #[tokio::test]
    async fn test_reprompt_sends_hm() {
        let (mut s, completion) = session(ChatParams::default(), Some("Still there?")).await;
        s.ingest_notify(&notify("Hi!", &[])).await;
        let mut v = volley(ChatCommand::Reprompt, None);
        s.handle_volley(&mut v).await;

        let seen = completion.seen.lock().unwrap();
        assert_eq!(seen[0].messages.last().unwrap().content, "hm");
    }

    #[tokio::test]
    async fn test_notify_builds_merged_history() {
        let mut s = bare_session(ChatParams::default(), Arc::new(ScriptedCompletion::default()));

        s.ingest_notify(&notify("Hello there.", &["hi", "how are you"])).await;
        s.ingest_notify(&notify("animation:wave", &[])).await;
        s.ingest_notify(&notify("I am fine.", &[])).await;

        assert_eq!(
            s.history(),
            &[
                ChatTurn::new(Role::User, "hi how are you"),
                ChatTurn::new(Role::Assistant, "Hello there. I am fine."),
            ]
        );
        assert_eq!(s.total_volleys(), 4);
    }

    #[test]
    fn test_push_turn_trims_to_max() {
        let mut history = Vec::new();
        for i in 0..5 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            push_turn(&mut history, role, &i.to_string(), 3);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "2");
    }

    #[tokio::test]
    async fn test_overflow_appends_exit_line_and_exits() {
        let chat = ChatParams {
            max_volleys: 1,
            ..Default::default()
        };
        let (mut s, _) = session(chat, Some("Nice chat.")).await;
        s.ingest_notify(&notify("Hello.", &[])).await;

        let mut v = volley(ChatCommand::Continue, Some("bye"));
        s.handle_volley(&mut v).await;
        assert_eq!(
            v.response.output.text,
            "Nice chat. Well, that was fun.  Let's move on."
        );
        assert_eq!(v.response.primary().action, ActionKind::ExitModule);
    }

    #[tokio::test]
    async fn test_inference_failure_speaks_apology() {
        let (mut s, _) = session(ChatParams::default(), None).await;
        let mut v = volley(ChatCommand::Continue, Some("hello"));
        s.handle_volley(&mut v).await;
        assert_eq!(v.response.output.text, INFERENCE_FAILED_TEXT);
    }

    #[tokio::test]
    async fn test_generated_directives_become_actions() {
        let (mut s, _) = session(ChatParams::default(), Some("Let's go! <launch:STORY:dragons>")).await;
        let mut v = volley(ChatCommand::Continue, Some("tell me a story"));
        s.handle_volley(&mut v).await;
        assert_eq!(v.response.output.text, "Let's go! ");
        assert_eq!(v.response.primary().action, ActionKind::Launch);
        assert_eq!(v.response.primary().module_id.as_deref(), Some("STORY"));
    }

    #[tokio::test]
    async fn test_pre_process_short_circuits() {
        let chat = ChatParams {
            code: Some(
                r#"
                function pre_process(volley, session)
                    if volley.request.speech == "nap" then
                        volley.response.output.text = "Nap time <sleep>"
                        return true
                    end
                    return false
                end
                "#
                .to_string(),
            ),
            ..Default::default()
        };
        let (mut s, completion) = session(chat, Some("from the model")).await;

        let mut v = volley(ChatCommand::Continue, Some("nap"));
        s.handle_volley(&mut v).await;
        assert_eq!(v.response.output.text, "Nap time ");
        assert_eq!(v.response.primary().action, ActionKind::Sleep);
        assert!(completion.seen.lock().unwrap().is_empty());

        let mut v = volley(ChatCommand::Continue, Some("talk"));
        s.handle_volley(&mut v).await;
        assert_eq!(v.response.output.text, "from the model");
    }

    #[tokio::test]
    async fn test_local_data_persists_between_volleys() {
        let chat = ChatParams {
            code: Some(
                r#"
                function post_process(volley, session)
                    volley.local_data.count = (volley.local_data.count or 0) + 1
                end
                "#
                .to_string(),
            ),
            ..Default::default()
        };
        let (mut s, _) = session(chat, Some("ok")).await;
        for _ in 0..3 {
            let mut v = volley(ChatCommand::Continue, Some("again"));
            s.handle_volley(&mut v).await;
        }
        assert_eq!(s.local_data()["count"], json!(3));
    }

    #[tokio::test]
    async fn test_hook_error_speaks_error_text() {
        let chat = ChatParams {
            code: Some("function post_process(volley, session) error('kaput') end".to_string()),
            ..Default::default()
        };
        let (mut s, _) = session(chat, Some("ok")).await;
        let mut v = volley(ChatCommand::Continue, Some("hi"));
        s.handle_volley(&mut v).await;

        assert!(v.response.output.text.starts_with("Error handling volley: "));
        assert!(v.response.output.text.contains("kaput"));
        assert_eq!(v.response.output.markup.as_deref(), Some(v.response.output.text.as_str()));
        assert_eq!(v.response.primary().action, ActionKind::Respond);
    }

    fn bare_session(chat: ChatParams, completion: Arc<ScriptedCompletion>) -> ChatSession {
        ChatSession {
            key: SessionKey::new("OPENMOXIE_CHAT", "default"),
            params: chat,
            model: "gpt-test".to_string(),
            history: Vec::new(),
            total_volleys: 0,
            local_data: LocalData::new(),
            hooks: Hooks::default(),
            completion,
            sandbox: Arc::new(LuaSandbox::new()),
            hook_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_complete_hook_detection() {
        let (plain, _) = session(ChatParams::default(), None).await;
        assert!(!plain.has_complete_hook());

        let chat = ChatParams {
            code: Some("function complete_handler(volley, session) log.info('done') end".to_string()),
            ..Default::default()
        };
        let (hooked, _) = session(chat, None).await;
        assert!(hooked.has_complete_hook());
    }

    #[tokio::test]
    async fn test_complete_hook_summarizes_final_state() {
        let chat = ChatParams {
            code: Some(
                r#"
                function complete_handler(volley, session)
                    local summary = session:summarize({
                        prompt = "Recap for " .. volley.local_data.child,
                        max_tokens = 40,
                    })
                    log.info(summary)
                end
                "#
                .to_string(),
            ),
            ..Default::default()
        };
        let (mut hooked, completion) = session(chat, Some("They talked about dragons.")).await;
        hooked.ingest_notify(&notify("Hello there.", &["hi"])).await;

        let mut local = LocalData::new();
        local.insert("child".to_string(), json!("Sam"));
        hooked.complete_hook(Volley::data_only(Some("d_1"), local)).await;

        let seen = completion.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].model, "gpt-test");
        assert_eq!(seen[0].max_tokens, 40);
        assert_eq!(
            seen[0].messages,
            vec![ChatTurn::new(
                Role::User,
                "Recap for Sam\nTranscript:\n\nuser: hi\nMoxie: Hello there."
            )]
        );
    }

    #[tokio::test]
    async fn test_summarize_defaults_and_failure() {
        let completion = Arc::new(ScriptedCompletion {
            reply: Some("A short chat.".to_string()),
            ..Default::default()
        });
        let mut s = bare_session(ChatParams::default(), completion.clone());
        s.ingest_notify(&notify("Hello there.", &["hi", "how are you"])).await;

        assert_eq!(s.summarize(&SummaryOptions::default()).await, "A short chat.");
        {
            let seen = completion.seen.lock().unwrap();
            assert_eq!(seen[0].max_tokens, 70);
            assert_eq!(
                seen[0].messages[0].content,
                format!("{DEFAULT_SUMMARY_PROMPT}\nTranscript:\n\nuser: hi how are you\nMoxie: Hello there.")
            );
        }

        let bare = SummaryOptions {
            prompt: Some("Just say hi".to_string()),
            model: Some("gpt-small".to_string()),
            append_transcript: false,
            ..Default::default()
        };
        s.summarize(&bare).await;
        {
            let seen = completion.seen.lock().unwrap();
            assert_eq!(seen[1].model, "gpt-small");
            assert_eq!(seen[1].messages[0].content, "Just say hi");
        }

        let broken = bare_session(ChatParams::default(), Arc::new(ScriptedCompletion::default()));
        assert_eq!(
            broken.summarize(&SummaryOptions::default()).await,
            "Error summarizing chat: no completion configured."
        );
    }

    #[test]
    fn test_summary_options_from_script() {
        assert_eq!(SummaryOptions::from_script(Value::Null).unwrap(), SummaryOptions::default());
        assert_eq!(
            SummaryOptions::from_script(json!("Recap")).unwrap().prompt.as_deref(),
            Some("Recap")
        );
        let opts = SummaryOptions::from_script(json!({"append_transcript": false})).unwrap();
        assert!(!opts.append_transcript);
        assert!(SummaryOptions::from_script(json!({"max_tokens": "lots"})).is_err());
    }

    #[tokio::test]
    async fn test_prompt_template_sees_volley_and_session() {
        let chat = ChatParams {
            prompt: "You talk with {{volley.config.child_name}} & friends after \
                     {{session.total_volleys}} volleys. Heard: {{volley.request.speech}}"
                .to_string(),
            ..Default::default()
        };
        let (mut s, completion) = session(chat, Some("ok")).await;
        s.ingest_notify(&notify("Hello.", &[])).await;

        let robot = RobotSnapshot {
            config: json!({"child_name": "Sam"}),
            ..Default::default()
        };
        let mut v = volley(ChatCommand::Continue, Some("tell me more")).with_robot(robot);
        s.handle_volley(&mut v).await;

        let seen = completion.seen.lock().unwrap();
        assert_eq!(seen[0].messages[0].role, Role::System);
        assert_eq!(
            seen[0].messages[0].content,
            "You talk with Sam & friends after 1 volleys. Heard: tell me more"
        );
    }

    #[tokio::test]
    async fn test_unrenderable_prompt_is_used_verbatim() {
        let chat = ChatParams {
            prompt: "Be kind {{#if volley}} always".to_string(),
            ..Default::default()
        };
        let (mut s, completion) = session(chat, Some("ok")).await;
        let mut v = volley(ChatCommand::Continue, Some("hi"));
        s.handle_volley(&mut v).await;

        assert_eq!(v.response.output.text, "ok");
        let seen = completion.seen.lock().unwrap();
        assert_eq!(seen[0].messages[0].content, "Be kind {{#if volley}} always");
    }

    #[tokio::test]
    async fn test_broken_code_loads_without_hooks() {
        let chat = ChatParams {
            code: Some("function pre_process(".to_string()),
            ..Default::default()
        };
        let (mut s, _) = session(chat, Some("still works")).await;
        let mut v = volley(ChatCommand::Continue, Some("hi"));
        s.handle_volley(&mut v).await;
        assert_eq!(v.response.output.text, "still works");
    }
}
