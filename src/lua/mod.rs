//! Lua scripting - sandboxed method execution

mod bindings;
mod convert;
mod engine;
mod sandbox;

pub use bindings::{ContextRef, ObjectRef, WorldRef};
pub use convert::{from_lua, to_lua};
pub use engine::LuaEngine;
pub use sandbox::{Sandbox, SandboxConfig, SandboxError};
