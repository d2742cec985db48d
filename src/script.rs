//! Script engine seam
//!
//! The object model never touches a scripting language directly. It resolves
//! which objects define a method and hands an [`Invocation`] to a
//! [`ScriptEngine`], which compiles and runs the source. Lua is the engine
//! the server ships with (see [`crate::lua::LuaEngine`]).

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::objects::{ObjectHandle, ObjectId, ObjectManager, Value};

/// Boxed non-`Send` future, as produced by engines
pub type LocalFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Opaque per-connection value passed through to method bodies
pub trait SessionContext {
    /// Stable session identifier
    fn id(&self) -> &str;

    /// Queue text for delivery to the connection
    fn send(&self, text: &str);

    /// Player object bound to this session, if logged in
    fn player(&self) -> Option<ObjectId>;

    fn set_player(&self, player: Option<ObjectId>);
}

/// One object in a method's resolution order that defines the method
#[derive(Debug, Clone)]
pub struct MethodSite {
    pub definer: ObjectId,
    pub source: String,
}

/// Everything an engine needs to run one step of a method call
#[derive(Clone)]
pub struct Invocation {
    pub receiver: ObjectHandle,
    pub method: String,
    /// Definers of `method`, receiver first, root last
    pub sites: Rc<[MethodSite]>,
    /// Index into `sites` of the implementation to run
    pub cursor: usize,
    pub args: Vec<Value>,
}

impl Invocation {
    pub fn new(receiver: ObjectHandle, method: &str, sites: Vec<MethodSite>, args: Vec<Value>) -> Self {
        Self {
            receiver,
            method: method.to_string(),
            sites: sites.into(),
            cursor: 0,
            args,
        }
    }

    /// The implementation this invocation runs
    pub fn site(&self) -> &MethodSite {
        &self.sites[self.cursor]
    }

    /// The next implementation toward the root (`pass()`), if any
    pub fn next(&self, args: Vec<Value>) -> Option<Invocation> {
        let cursor = self.cursor + 1;
        if cursor >= self.sites.len() {
            return None;
        }
        Some(Invocation {
            receiver: self.receiver.clone(),
            method: self.method.clone(),
            sites: self.sites.clone(),
            cursor,
            args,
        })
    }
}

/// A pluggable compiler/executor for method source
pub trait ScriptEngine {
    /// Short name of the scripting dialect
    fn dialect(&self) -> &'static str;

    /// Compile (if needed) and run the current site of `invocation`
    fn invoke<'a>(
        &'a self,
        manager: &'a ObjectManager,
        invocation: Invocation,
    ) -> LocalFuture<'a, Result<Value>>;

    /// Drop any compiled artifact for `object`'s `method`
    fn invalidate(&self, object: ObjectId, method: &str);

    /// When the cached artifact for `object`'s `method` was compiled
    fn compiled_at(&self, object: ObjectId, method: &str) -> Option<DateTime<Utc>>;
}
