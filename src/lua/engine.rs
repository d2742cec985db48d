//! Lua method engine
//!
//! Compiles method source on first use and caches the compiled function per
//! (definer, method), keyed by a hash of the source so edits made through
//! any path are picked up. Each invocation receives the bindings
//! `self, args, context, player, world, pass` and a global environment of
//! its own that reads through to the sandbox globals.

use std::cell::RefCell;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mlua::{
    AnyUserData, ExternalResult, Function, MultiValue, Result as LuaResult, Table,
    Value as LuaValue,
};
use tracing::{debug, warn};

use super::bindings::{object_value, ContextRef, WorldRef};
use super::convert::{args_from_lua, from_lua, to_lua};
use super::sandbox::{Sandbox, SandboxConfig, SandboxError, DEADLINE_MESSAGE};
use crate::error::{Result, RuntimeError};
use crate::objects::{hash_source, CallScope, ObjectId, ObjectManager, Value, WeakManager};
use crate::script::{Invocation, LocalFuture, ScriptEngine};

struct CompiledMethod {
    hash: String,
    function: Function,
    compiled_at: DateTime<Utc>,
}

type Bindings = (AnyUserData, Table, LuaValue, AnyUserData, AnyUserData, Function, Table);

pub struct LuaEngine {
    sandbox: Sandbox,
    compiled: RefCell<HashMap<(ObjectId, String), CompiledMethod>>,
}

impl LuaEngine {
    pub fn new(config: SandboxConfig) -> std::result::Result<Self, SandboxError> {
        Ok(Self {
            sandbox: Sandbox::new(config)?,
            compiled: RefCell::new(HashMap::new()),
        })
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Number of cached compiled methods
    pub fn compiled_count(&self) -> usize {
        self.compiled.borrow().len()
    }

    fn function_for(&self, definer: ObjectId, method: &str, source: &str) -> Result<Function> {
        let hash = hash_source(source);
        let key = (definer, method.to_string());
        if let Some(cached) = self.compiled.borrow().get(&key) {
            if cached.hash == hash {
                return Ok(cached.function.clone());
            }
        }

        let function = self
            .sandbox
            .compile(&format!("#{definer}:{method}"), source)
            .map_err(|e| RuntimeError::CompileError {
                object: definer,
                method: method.to_string(),
                message: compile_message(&e),
            })?;
        debug!(object = definer, method, "Compiled method");

        self.compiled.borrow_mut().insert(
            key,
            CompiledMethod {
                hash,
                function: function.clone(),
                compiled_at: Utc::now(),
            },
        );
        Ok(function)
    }

    fn bindings(&self, manager: &WeakManager, invocation: &Invocation) -> LuaResult<Bindings> {
        let lua = self.sandbox.lua();
        let scope = CallScope::current();
        let receiver = invocation.receiver.id();

        let this = object_value(lua, receiver, manager)?;
        let args = lua.create_table()?;
        for (i, value) in invocation.args.iter().enumerate() {
            args.set(i + 1, to_lua(lua, value, manager)?)?;
        }
        let context = match scope.as_ref().and_then(|s| s.context.clone()) {
            Some(session) => {
                LuaValue::UserData(lua.create_userdata(ContextRef::new(session, manager.clone()))?)
            }
            None => LuaValue::Nil,
        };
        let player_id = scope.as_ref().and_then(|s| s.player).unwrap_or(receiver);
        let player = object_value(lua, player_id, manager)?;
        let world = lua.create_userdata(WorldRef::new(manager.clone()))?;
        let pass = self.pass_function(manager, invocation)?;
        let env = self.sandbox.call_env()?;

        Ok((this, args, context, player, world, pass, env))
    }

    /// `pass(...)` runs the next definer toward the root with the same
    /// receiver, using exactly the arguments given to it
    fn pass_function(&self, manager: &WeakManager, invocation: &Invocation) -> LuaResult<Function> {
        let manager = manager.clone();
        let invocation = invocation.clone();
        self.sandbox
            .lua()
            .create_async_function(move |lua, args: MultiValue| {
                let manager = manager.clone();
                let invocation = invocation.clone();
                async move {
                    let args = args_from_lua(args)?;
                    let next = invocation.next(args).ok_or_else(|| {
                        mlua::Error::runtime(format!(
                            "pass(): no ancestor of #{} above #{} defines '{}'",
                            invocation.receiver.id(),
                            invocation.site().definer,
                            invocation.method
                        ))
                    })?;
                    let strong = manager.upgrade().into_lua_err()?;
                    let engine = strong.engine();
                    let result = engine.invoke(&strong, next).await.into_lua_err()?;
                    to_lua(&lua, &result, &manager)
                }
            })
    }

    fn failure(invocation: &Invocation, error: mlua::Error) -> RuntimeError {
        let message = root_cause(&error);
        if CallScope::deadline_passed() || message.ends_with(DEADLINE_MESSAGE) {
            return RuntimeError::DeadlineExceeded;
        }
        warn!(
            object = invocation.receiver.id(),
            method = %invocation.method,
            definer = invocation.site().definer,
            error = %message,
            "Method raised an error"
        );
        RuntimeError::Script {
            object: invocation.receiver.id(),
            method: invocation.method.clone(),
            message,
        }
    }
}

/// Innermost message of a Lua error, without callback tracebacks
fn root_cause(error: &mlua::Error) -> String {
    match error {
        mlua::Error::CallbackError { cause, .. } => root_cause(cause),
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

fn compile_message(error: &SandboxError) -> String {
    match error {
        SandboxError::LuaError(e) => root_cause(e),
        other => other.to_string(),
    }
}

impl ScriptEngine for LuaEngine {
    fn dialect(&self) -> &'static str {
        "lua54"
    }

    fn invoke<'a>(
        &'a self,
        manager: &'a ObjectManager,
        invocation: Invocation,
    ) -> LocalFuture<'a, Result<Value>> {
        Box::pin(async move {
            let site = invocation.site().clone();
            let function = self.function_for(site.definer, &invocation.method, &site.source)?;
            let bindings = self
                .bindings(&manager.downgrade(), &invocation)
                .map_err(|e| Self::failure(&invocation, e))?;

            let result: LuaResult<LuaValue> = function.call_async(bindings).await;
            result
                .and_then(from_lua)
                .map_err(|e| Self::failure(&invocation, e))
        })
    }

    fn invalidate(&self, object: ObjectId, method: &str) {
        self.compiled
            .borrow_mut()
            .remove(&(object, method.to_string()));
    }

    fn compiled_at(&self, object: ObjectId, method: &str) -> Option<DateTime<Utc>> {
        self.compiled
            .borrow()
            .get(&(object, method.to_string()))
            .map(|c| c.compiled_at)
    }
}
