//! Fleet-wide global commands.
//!
//! Global responses are regex patterns checked against every utterance
//! before any session sees it. A match wins outright: the device gets the
//! pattern's reply and no session is looked up or created.
//!
//! Patterns are matched against lower-cased speech and must match at the
//! start of it (`^what time` and `what time` behave the same). Use `$` to
//! require a whole-utterance match. Keep patterns narrow; a pattern like
//! `.*` swallows every input on every device.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use hiveproto::{ActionKind, OutputType, ResponseEnvelope, Volley};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogError, GlobalResponseSpec, PatternKind};
use crate::sandbox::{Sandbox, SandboxError, ScriptCall};

/// A compiled global response.
#[derive(Debug)]
pub struct GlobalPattern {
    spec: GlobalResponseSpec,
    regex: Regex,
}

impl GlobalPattern {
    pub fn compile(spec: GlobalResponseSpec) -> Result<Self, CatalogError> {
        let regex = Regex::new(&spec.pattern).map_err(|source| CatalogError::Pattern {
            name: spec.name.clone(),
            source,
        })?;
        Ok(Self { spec, regex })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn kind(&self) -> PatternKind {
        self.spec.action
    }

    pub fn sort_key(&self) -> i64 {
        self.spec.sort_key
    }

    /// Capture groups when the pattern matches at the start of `speech`.
    fn match_start(&self, speech: &str) -> Option<Vec<Option<String>>> {
        let caps = self.regex.captures(speech)?;
        if caps.get(0)?.start() != 0 {
            return None;
        }
        Some(
            caps.iter()
                .map(|g| g.map(|m| m.as_str().to_string()))
                .collect(),
        )
    }
}

type Snapshot = Arc<Vec<Arc<GlobalPattern>>>;

/// Ordered set of global patterns, replaced wholesale on reload.
pub struct GlobalCommandMatcher {
    patterns: RwLock<Snapshot>,
    sandbox: Arc<dyn Sandbox>,
    method_timeout: Duration,
}

impl GlobalCommandMatcher {
    pub fn new(sandbox: Arc<dyn Sandbox>, method_timeout: Duration) -> Self {
        Self {
            patterns: RwLock::new(Arc::new(Vec::new())),
            sandbox,
            method_timeout,
        }
    }

    /// Compile `specs` and swap them in. Nothing changes if any pattern
    /// fails to compile.
    pub fn reload(&self, specs: &[GlobalResponseSpec]) -> Result<(), CatalogError> {
        let compiled = compile_all(specs)?;
        self.install(compiled);
        Ok(())
    }

    pub(crate) fn install(&self, compiled: Vec<Arc<GlobalPattern>>) {
        for p in &compiled {
            info!(pattern.name = p.name(), kind = ?p.kind(), sort_key = p.sort_key(), "Loaded global response");
        }
        let snapshot = Arc::new(compiled);
        match self.patterns.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    fn snapshot(&self) -> Snapshot {
        match self.patterns.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// The first pattern matching the volley's speech, ready to run.
    pub fn check(&self, volley: &Volley) -> Option<PendingCommand> {
        let speech = volley.request.speech.as_deref().filter(|s| !s.is_empty())?;
        let speech = speech.to_lowercase();

        self.snapshot().iter().find_map(|pattern| {
            let groups = pattern.match_start(&speech)?;
            debug!(pattern.name = pattern.name(), "Global response matched");
            Some(PendingCommand {
                pattern: pattern.clone(),
                groups,
                volley: volley.clone(),
                sandbox: self.sandbox.clone(),
                limit: self.method_timeout,
            })
        })
    }
}

/// Compile and order patterns: highest `sort_key` first, ties in the order
/// given.
pub(crate) fn compile_all(specs: &[GlobalResponseSpec]) -> Result<Vec<Arc<GlobalPattern>>, CatalogError> {
    let mut compiled = specs
        .iter()
        .cloned()
        .map(|spec| GlobalPattern::compile(spec).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;
    compiled.sort_by_key(|p| std::cmp::Reverse(p.sort_key()));
    Ok(compiled)
}

/// A matched global command that has not run yet.
pub struct PendingCommand {
    pattern: Arc<GlobalPattern>,
    groups: Vec<Option<String>>,
    volley: Volley,
    sandbox: Arc<dyn Sandbox>,
    limit: Duration,
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("pattern", &self.pattern.name())
            .field("groups", &self.groups)
            .finish()
    }
}

impl PendingCommand {
    pub fn pattern_name(&self) -> &str {
        self.pattern.name()
    }

    /// Build the response. Script failures become spoken `Script error`
    /// text; this never fails.
    pub async fn execute(self) -> ResponseEnvelope {
        let spec = &self.pattern.spec;
        let request = &self.volley.request;

        match spec.action {
            PatternKind::Response | PatternKind::Launch | PatternKind::ConfirmLaunch => {
                let mut resp = ResponseEnvelope::new_response(request, OutputType::GlobalCommand);
                resp.set_output(&spec.response_text, Some(spec.response_markup.as_str()), None);
                let kind = match spec.action {
                    PatternKind::Launch => Some(ActionKind::Launch),
                    PatternKind::ConfirmLaunch => Some(ActionKind::LaunchIfConfirmed),
                    _ => None,
                };
                if let Some(kind) = kind {
                    resp.add_action(
                        kind,
                        spec.module_id.as_deref(),
                        spec.content_id.as_deref(),
                        OutputType::GlobalCommand,
                    );
                }
                resp
            }
            PatternKind::Method => self.run_method().await,
        }
    }

    fn entities(&self) -> Vec<String> {
        self.pattern
            .spec
            .entity_groups
            .iter()
            .map(|&i| self.groups.get(i).cloned().flatten().unwrap_or_default())
            .collect()
    }

    async fn run_method(&self) -> ResponseEnvelope {
        let spec = &self.pattern.spec;
        let mut volley = self.volley.clone();
        volley.reset_response();
        let entities = self.entities();
        volley.set_entities(&entities);

        let Some(code) = spec.code.as_deref() else {
            volley.set_output("Script error: Could not locate method get_response", None);
            return volley.response;
        };

        let started = Instant::now();
        match self.call_method(code, &mut volley, entities).await {
            Ok(()) => {}
            Err(SandboxError::Timeout(_)) => {
                error!(pattern.name = %spec.name, "Method code exceeded time limit");
                volley.set_output("Script error: Timeout exceeded", None);
            }
            Err(_) if started.elapsed() >= self.limit => {
                error!(pattern.name = %spec.name, "Method code exceeded time limit");
                volley.set_output("Script error: Timeout exceeded", None);
            }
            Err(SandboxError::MissingFunction(_)) => {
                warn!(pattern.name = %spec.name, "Method code defines no entry point");
                volley.set_output("Script error: Could not locate method get_response", None);
            }
            Err(e) => {
                error!(pattern.name = %spec.name, error = %e, "Method code failed");
                volley.set_output(&format!("Script error: {e}"), None);
            }
        }
        volley.response
    }

    /// Try `get_response(request, response, entities)`, then
    /// `handle_volley(volley)`. Both share one time budget.
    async fn call_method(
        &self,
        code: &str,
        volley: &mut Volley,
        entities: Vec<String>,
    ) -> Result<(), SandboxError> {
        let deadline = Instant::now() + self.limit;
        let args = vec![
            serde_json::to_value(&volley.request).map_err(|e| SandboxError::Script(e.to_string()))?,
            volley.response.to_json(),
            Value::Array(entities.into_iter().map(Value::String).collect()),
        ];

        match self
            .sandbox
            .call(ScriptCall::new(code, "get_response", args), self.limit)
            .await
        {
            Ok(output) => {
                match &output.result {
                    Value::String(text) if !text.is_empty() => {
                        volley.set_output(text, None);
                    }
                    Value::Object(_) => {
                        volley.response = serde_json::from_value(output.result.clone()).map_err(|e| {
                            SandboxError::Script(format!("get_response returned an invalid response: {e}"))
                        })?;
                    }
                    _ if output.is_falsy() => {
                        if let Some(edited) = output.args.get(1) {
                            volley.response = serde_json::from_value(edited.clone()).map_err(|e| {
                                SandboxError::Script(format!("get_response left an invalid response: {e}"))
                            })?;
                        }
                    }
                    other => {
                        return Err(SandboxError::Script(format!(
                            "get_response returned unsupported value {other}"
                        )));
                    }
                }
                Ok(())
            }
            Err(SandboxError::MissingFunction(_)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(SandboxError::Timeout(self.limit));
                }
                let output = self
                    .sandbox
                    .call(ScriptCall::new(code, "handle_volley", vec![volley.to_json()]), remaining)
                    .await
                    .map_err(|e| match e {
                        SandboxError::MissingFunction(_) => {
                            SandboxError::MissingFunction("get_response".to_string())
                        }
                        other => other,
                    })?;
                if let Some(edited) = output.args.first() {
                    volley
                        .apply_json(edited)
                        .map_err(|e| SandboxError::Script(format!("handle_volley left an invalid volley: {e}")))?;
                }
                if let Value::String(text) = &output.result {
                    if !text.is_empty() {
                        volley.set_output(text, None);
                    }
                }
                volley.ingest_action_tags();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
