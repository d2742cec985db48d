//! Lua sandbox - restricted execution environment shared by all methods

use mlua::{Function, HookTriggers, Lua, Result as LuaResult, StdLib, Table, Value, VmState};
use thiserror::Error;
use tracing::debug;

use super::convert::from_lua;
use crate::objects::CallScope;

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 64MB)
    pub max_memory: usize,
    /// Instructions between deadline checks (default: 1000)
    pub hook_interval: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024, // 64MB
            hook_interval: 1000,
        }
    }
}

/// Errors that can occur while building or using the sandbox
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid sandbox configuration: {0}")]
    Config(String),

    #[error("Lua error: {0}")]
    LuaError(#[from] mlua::Error),
}

/// Message raised inside the VM when a chain runs past its deadline
pub(crate) const DEADLINE_MESSAGE: &str = "call deadline exceeded";

/// Every method body is compiled as a function of these bindings. The
/// seventh argument is the per-call environment; globals a body assigns
/// land there and vanish when the call returns.
const PROLOGUE: &str = "local self, args, context, player, world, pass, _CALL_ENV = ...\n\
                        local _ENV = _CALL_ENV or _ENV\n";

/// A sandboxed Lua state
pub struct Sandbox {
    lua: Lua,
    config: SandboxConfig,
}

impl Sandbox {
    /// Create a new sandbox with the given configuration
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        if config.hook_interval == 0 {
            return Err(SandboxError::Config("hook_interval must be positive".into()));
        }

        // Create Lua with minimal standard libraries
        let lua = Lua::new_with(
            StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
            mlua::LuaOptions::default(),
        )?;

        lua.set_memory_limit(config.max_memory)?;

        // Whichever chain is running when the hook fires owns the deadline
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(config.hook_interval),
            |_lua, _debug| {
                if CallScope::deadline_passed() {
                    Err(mlua::Error::runtime(DEADLINE_MESSAGE))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        Self::remove_dangerous_globals(&lua)?;
        Self::add_safe_globals(&lua)?;

        Ok(Self { lua, config })
    }

    /// Remove dangerous global functions/tables
    fn remove_dangerous_globals(lua: &Lua) -> LuaResult<()> {
        let globals = lua.globals();

        let dangerous = [
            "os",
            "io",
            "loadfile",
            "dofile",
            "load",
            "loadstring",
            "require",
            "package",
            "debug",
            "collectgarbage",
        ];

        for name in dangerous {
            globals.set(name, Value::Nil)?;
        }

        Ok(())
    }

    /// Add safe utility functions
    fn add_safe_globals(lua: &Lua) -> LuaResult<()> {
        let globals = lua.globals();

        // print goes to the server log rather than stdout
        let safe_print = lua.create_function(|_, args: mlua::MultiValue| {
            let line = args
                .into_iter()
                .map(|v| match from_lua(v.clone()) {
                    Ok(value) => value.to_string(),
                    Err(_) => format!("<{}>", v.type_name()),
                })
                .collect::<Vec<_>>()
                .join("\t");
            debug!(target: "protomud::script", "{}", line);
            Ok(())
        })?;
        globals.set("print", safe_print)?;

        Ok(())
    }

    /// Get the sandbox configuration
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Compile a method body into a function of the standard bindings
    pub fn compile(&self, chunk_name: &str, source: &str) -> Result<Function, SandboxError> {
        let function = self
            .lua
            .load(format!("{PROLOGUE}{source}"))
            .set_name(chunk_name)
            .into_function()?;
        Ok(function)
    }

    /// Fresh environment for one method call: reads fall through to the
    /// sandbox globals, writes stay local to the call
    pub fn call_env(&self) -> LuaResult<Table> {
        let env = self.lua.create_table()?;
        let meta = self.lua.create_table()?;
        meta.set("__index", self.lua.globals())?;
        env.set_metatable(Some(meta));
        Ok(env)
    }

    /// Evaluate a standalone chunk
    pub fn eval<R>(&self, code: &str) -> Result<R, SandboxError>
    where
        R: mlua::FromLuaMulti,
    {
        Ok(self.lua.load(code).eval()?)
    }

    /// Check if a global exists (for testing that dangerous globals are removed)
    pub fn global_exists(&self, name: &str) -> bool {
        self.lua
            .globals()
            .get::<Value>(name)
            .map(|v| !matches!(v, Value::Nil))
            .unwrap_or(false)
    }

    /// Get current memory usage
    pub fn memory_used(&self) -> usize {
        self.lua.used_memory()
    }

    /// Access the underlying Lua state
    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}
