//! Lua sandbox for operator-authored code.
//!
//! Global METHOD patterns and chat session hooks are small Lua scripts
//! stored in the content catalog. Each call gets a fresh VM with the
//! dangerous parts of the standard library removed, runs on the blocking
//! pool and is bounded by a wall-clock timeout and a memory limit. An
//! instruction hook aborts the VM once the deadline has passed so an
//! abandoned call stops burning a blocking thread.
//!
//! Values cross the boundary through mlua's serde support. JSON arrays get
//! the array metatable, so an empty list comes back out as `[]`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mlua::{
    DeserializeOptions, HookTriggers, Lua, LuaSerdeExt, MultiValue, SerializeOptions,
    Value as LuaValue, VmState,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::time::timeout;

/// Instructions between deadline checks.
const HOOK_INTERVAL: u32 = 1_000;

/// Memory a single script VM may allocate unless configured otherwise.
pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Timeout exceeded after {0:?}")]
    Timeout(Duration),

    #[error("Could not locate method {0}")]
    MissingFunction(String),

    #[error("{0}")]
    Script(String),

    #[error("script task failed: {0}")]
    Task(String),
}

impl From<mlua::Error> for SandboxError {
    fn from(e: mlua::Error) -> Self {
        SandboxError::Script(e.to_string())
    }
}

/// Host function handed to a script. It runs on the script's blocking
/// thread, takes the script's argument as JSON and returns JSON.
pub type HostFn = Arc<dyn Fn(JsonValue) -> Result<JsonValue, String> + Send + Sync>;

/// A host function installed as a field of one of the call's table
/// arguments, callable as `arg.name(opts)` or `arg:name(opts)`.
#[derive(Clone)]
pub struct HostMethod {
    pub arg: usize,
    pub name: String,
    pub func: HostFn,
}

impl std::fmt::Debug for HostMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMethod")
            .field("arg", &self.arg)
            .field("name", &self.name)
            .finish()
    }
}

/// A function call into a script.
#[derive(Debug, Clone)]
pub struct ScriptCall {
    pub code: String,
    pub function: String,
    pub args: Vec<JsonValue>,
    pub methods: Vec<HostMethod>,
}

impl ScriptCall {
    pub fn new(code: &str, function: &str, args: Vec<JsonValue>) -> Self {
        Self {
            code: code.to_string(),
            function: function.to_string(),
            args,
            methods: Vec::new(),
        }
    }

    pub fn with_method(mut self, arg: usize, name: &str, func: HostFn) -> Self {
        self.methods.push(HostMethod {
            arg,
            name: name.to_string(),
            func,
        });
        self
    }
}

/// What a script call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutput {
    /// The function's return value (`null` for nil).
    pub result: JsonValue,
    /// The arguments as they looked after the call. Tables are passed by
    /// reference, so scripts can edit them in place.
    pub args: Vec<JsonValue>,
}

impl ScriptOutput {
    /// Lua truthiness plus "empty string is nothing".
    pub fn is_falsy(&self) -> bool {
        match &self.result {
            JsonValue::Null | JsonValue::Bool(false) => true,
            JsonValue::String(s) => s.is_empty(),
            _ => false,
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Load `call.code`, then call `call.function(args...)`.
    async fn call(&self, call: ScriptCall, limit: Duration) -> Result<ScriptOutput, SandboxError>;

    /// Whether `code` defines a global function named `function`.
    async fn defines(&self, code: &str, function: &str, limit: Duration) -> Result<bool, SandboxError>;
}

/// The stock sandbox: Lua 5.4 via mlua.
#[derive(Debug, Clone)]
pub struct LuaSandbox {
    memory_limit: usize,
}

impl Default for LuaSandbox {
    fn default() -> Self {
        Self::with_memory_limit(DEFAULT_MEMORY_LIMIT)
    }
}

impl LuaSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sandbox whose VMs fail allocations past `bytes`.
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self { memory_limit: bytes }
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }
}

#[async_trait]
impl Sandbox for LuaSandbox {
    async fn call(&self, call: ScriptCall, limit: Duration) -> Result<ScriptOutput, SandboxError> {
        let deadline = Instant::now() + limit;
        let memory_limit = self.memory_limit;
        let task = tokio::task::spawn_blocking(move || call_blocking(&call, deadline, memory_limit));

        match timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(SandboxError::Task(join.to_string())),
            Err(_) => Err(SandboxError::Timeout(limit)),
        }
    }

    async fn defines(&self, code: &str, function: &str, limit: Duration) -> Result<bool, SandboxError> {
        let code = code.to_string();
        let function = function.to_string();
        let deadline = Instant::now() + limit;
        let memory_limit = self.memory_limit;
        let task = tokio::task::spawn_blocking(move || -> Result<bool, SandboxError> {
            let lua = create_sandboxed_lua(deadline, memory_limit)?;
            lua.load(code.as_str()).set_name("script").exec()?;
            let value: LuaValue = lua.globals().get(function.as_str())?;
            Ok(matches!(value, LuaValue::Function(_)))
        });

        match timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(SandboxError::Task(join.to_string())),
            Err(_) => Err(SandboxError::Timeout(limit)),
        }
    }
}

/// Execute a call synchronously (called from spawn_blocking).
fn call_blocking(
    call: &ScriptCall,
    deadline: Instant,
    memory_limit: usize,
) -> Result<ScriptOutput, SandboxError> {
    let lua = create_sandboxed_lua(deadline, memory_limit)?;

    lua.load(call.code.as_str()).set_name("script").exec()?;

    let function = match lua.globals().get::<LuaValue>(call.function.as_str())? {
        LuaValue::Function(f) => f,
        _ => return Err(SandboxError::MissingFunction(call.function.clone())),
    };

    let lua_args = call
        .args
        .iter()
        .map(|arg| json_to_lua(&lua, arg))
        .collect::<Result<Vec<_>, _>>()?;

    for method in &call.methods {
        if let Some(LuaValue::Table(target)) = lua_args.get(method.arg) {
            install_method(&lua, target, method)?;
        }
    }

    let result: LuaValue = function.call(MultiValue::from_iter(lua_args.iter().cloned()))?;

    let args = lua_args
        .iter()
        .zip(&call.args)
        .map(|(lua_arg, original)| match lua_arg {
            LuaValue::Table(_) => lua_to_json(&lua, lua_arg),
            _ => Ok(original.clone()),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ScriptOutput {
        result: lua_to_json(&lua, &result)?,
        args,
    })
}

/// Set `method` as a function field of `target`. A leading `target`
/// argument (method-call syntax) is skipped.
fn install_method(lua: &Lua, target: &mlua::Table, method: &HostMethod) -> Result<(), SandboxError> {
    let target_ptr = target.to_pointer() as usize;
    let func = method.func.clone();
    let name = method.name.clone();

    let callable = lua.create_function(move |lua, args: MultiValue| {
        let options = args
            .into_iter()
            .filter(|v| !matches!(v, LuaValue::Table(t) if t.to_pointer() as usize == target_ptr))
            .find(|v| !v.is_nil())
            .map(|v| lua_to_json(lua, &v))
            .transpose()
            .map_err(mlua::Error::external)?
            .unwrap_or(JsonValue::Null);
        let out = func(options).map_err(|e| mlua::Error::RuntimeError(format!("{name}: {e}")))?;
        json_to_lua(lua, &out)
    })?;
    target.set(method.name.as_str(), callable)?;
    Ok(())
}

/// Create a sandboxed Lua VM with restricted globals.
fn create_sandboxed_lua(deadline: Instant, memory_limit: usize) -> Result<Lua, SandboxError> {
    let lua = Lua::new();
    lua.set_memory_limit(memory_limit)?;

    register_stdlib(&lua)?;
    remove_dangerous_globals(&lua)?;

    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError("Timeout exceeded".to_string()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    Ok(lua)
}

/// Register the `log` table, bridged to tracing.
fn register_stdlib(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let log_table = lua.create_table()?;

    log_table.set(
        "info",
        lua.create_function(|_, msg: String| {
            tracing::info!(target: "hive.script", "{}", msg);
            Ok(())
        })?,
    )?;
    log_table.set(
        "warn",
        lua.create_function(|_, msg: String| {
            tracing::warn!(target: "hive.script", "{}", msg);
            Ok(())
        })?,
    )?;
    log_table.set(
        "error",
        lua.create_function(|_, msg: String| {
            tracing::error!(target: "hive.script", "{}", msg);
            Ok(())
        })?,
    )?;
    log_table.set(
        "debug",
        lua.create_function(|_, msg: String| {
            tracing::debug!(target: "hive.script", "{}", msg);
            Ok(())
        })?,
    )?;

    globals.set("log", log_table)?;
    Ok(())
}

/// Remove globals that could be used to escape the sandbox.
fn remove_dangerous_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.set("dofile", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("require", LuaValue::Nil)?;

    // Keep: os.clock, os.date, os.difftime, os.time
    let os_table: mlua::Table = globals.get("os")?;
    for name in [
        "execute", "exit", "getenv", "remove", "rename", "setenv", "setlocale", "tmpname",
    ] {
        os_table.set(name, LuaValue::Nil)?;
    }

    globals.set("debug", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("package", LuaValue::Nil)?;

    Ok(())
}

/// Convert a JSON value to a Lua value. `null` becomes `nil` and arrays
/// carry the array metatable.
pub(crate) fn json_to_lua(lua: &Lua, json: &JsonValue) -> mlua::Result<LuaValue> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    lua.to_value_with(json, options)
}

/// Convert a Lua value to a JSON value. Tables marked as arrays, or with
/// keys `1..n`, become arrays. Functions and other values JSON cannot hold
/// are dropped.
pub(crate) fn lua_to_json(lua: &Lua, lua_val: &LuaValue) -> Result<JsonValue, SandboxError> {
    let options = DeserializeOptions::new().deny_unsupported_types(false);
    Ok(lua.from_value_with(lua_val.clone(), options)?)
}
