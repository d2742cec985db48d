//! Userdata exposed to method bodies: object references, the world, and the
//! session context

use std::rc::Rc;

use mlua::{
    AnyUserData, ExternalError, ExternalResult, Function, Lua, MetaMethod, MultiValue,
    Result as LuaResult, Table, UserData, UserDataFields, UserDataMethods, Value as LuaValue,
};

use super::convert::{args_from_lua, from_lua, to_lua};
use crate::error::{Result, RuntimeError};
use crate::objects::{
    MethodOptions, ObjectHandle, ObjectId, Properties, Value, WeakManager, ROOT_ID,
};
use crate::script::SessionContext;

/// A lazy reference to an object. Every operation goes through the manager,
/// so a reference outlives eviction and reloads transparently.
#[derive(Clone)]
pub struct ObjectRef {
    pub id: ObjectId,
    manager: WeakManager,
}

impl ObjectRef {
    pub fn new(id: ObjectId, manager: WeakManager) -> Self {
        Self { id, manager }
    }

    async fn handle(&self) -> Result<ObjectHandle> {
        self.manager.upgrade()?.load(self.id).await
    }

    fn sibling(&self, id: ObjectId) -> ObjectRef {
        ObjectRef::new(id, self.manager.clone())
    }
}

/// Extract an object id from a reference or a bare integer
fn object_id(value: &LuaValue) -> Option<ObjectId> {
    match value {
        LuaValue::Integer(i) => Some(*i),
        LuaValue::UserData(ud) => ud.borrow::<ObjectRef>().ok().map(|r| r.id),
        _ => None,
    }
}

fn require_object(value: &LuaValue) -> LuaResult<ObjectId> {
    object_id(value).ok_or_else(|| {
        mlua::Error::runtime(format!("expected an object, got {}", value.type_name()))
    })
}

fn optional_object(value: &LuaValue) -> LuaResult<Option<ObjectId>> {
    match value {
        LuaValue::Nil => Ok(None),
        other => require_object(other).map(Some),
    }
}

fn names(lua: &Lua, names: impl IntoIterator<Item = String>) -> LuaResult<Table> {
    lua.create_sequence_from(names)
}

/// Wrap a method as a plain function so `obj.greet(obj, ...)` and
/// `obj:greet(...)` both work. A leading self argument is dropped.
fn bound_method(lua: &Lua, target: &ObjectRef, method: &str) -> LuaResult<Function> {
    let target = target.clone();
    let method = method.to_string();
    lua.create_async_function(move |lua, args: MultiValue| {
        let target = target.clone();
        let method = method.clone();
        async move {
            let mut values: Vec<LuaValue> = args.into_iter().collect();
            if values.first().and_then(object_id_of_ref) == Some(target.id) {
                values.remove(0);
            }
            let args = values
                .into_iter()
                .map(from_lua)
                .collect::<LuaResult<Vec<_>>>()?;
            let handle = target.handle().await.into_lua_err()?;
            let result = handle.call(&method, args).await.into_lua_err()?;
            to_lua(&lua, &result, &target.manager)
        }
    })
}

fn object_id_of_ref(value: &LuaValue) -> Option<ObjectId> {
    match value {
        LuaValue::UserData(ud) => ud.borrow::<ObjectRef>().ok().map(|r| r.id),
        _ => None,
    }
}

impl UserData for ObjectRef {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("id", |_, this| Ok(this.id));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_async_method("get", |lua, this, key: String| {
            let this = ObjectRef::clone(&this);
            async move {
                let handle = this.handle().await.into_lua_err()?;
                match handle.get(&key).await.into_lua_err()? {
                    Some(value) => to_lua(&lua, &value, &this.manager),
                    None => Ok(LuaValue::Nil),
                }
            }
        });

        methods.add_async_method("set", |_, this, (key, value): (String, LuaValue)| {
            let this = ObjectRef::clone(&this);
            async move {
                let handle = this.handle().await.into_lua_err()?;
                if matches!(value, LuaValue::Nil) {
                    handle.remove(&key).await.into_lua_err()?;
                } else {
                    handle.set(&key, from_lua(value)?).await.into_lua_err()?;
                }
                Ok(())
            }
        });

        methods.add_async_method("call", |lua, this, (method, args): (String, MultiValue)| {
            let this = ObjectRef::clone(&this);
            async move {
                let args = args_from_lua(args)?;
                let handle = this.handle().await.into_lua_err()?;
                let result = handle.call(&method, args).await.into_lua_err()?;
                to_lua(&lua, &result, &this.manager)
            }
        });

        methods.add_async_method("has_method", |_, this, name: String| {
            let this = ObjectRef::clone(&this);
            async move {
                let handle = this.handle().await.into_lua_err()?;
                handle.has_method_async(&name).await.into_lua_err()
            }
        });

        methods.add_async_method("set_method", |_, this, (name, source): (String, String)| {
            let this = ObjectRef::clone(&this);
            async move {
                let handle = this.handle().await.into_lua_err()?;
                handle
                    .set_method(&name, &source, MethodOptions::default())
                    .await
                    .into_lua_err()
            }
        });

        methods.add_async_method("command", |_, this, verb: String| {
            let this = ObjectRef::clone(&this);
            async move {
                let handle = this.handle().await.into_lua_err()?;
                handle.resolve_command(&verb).await.into_lua_err()
            }
        });

        methods.add_async_method("parent", |_, this, ()| {
            let this = ObjectRef::clone(&this);
            async move {
                let handle = this.handle().await.into_lua_err()?;
                let parent = handle.parent_handle().await.into_lua_err()?;
                Ok(parent.map(|p| this.sibling(p.id())))
            }
        });

        methods.add_async_method("set_parent", |_, this, parent: LuaValue| {
            let this = ObjectRef::clone(&this);
            async move {
                let parent = optional_object(&parent)?;
                let handle = this.handle().await.into_lua_err()?;
                handle.set_parent(parent).await.into_lua_err()
            }
        });

        methods.add_async_method("is_valid", |_, this, ()| {
            let this = ObjectRef::clone(&this);
            async move {
                match this.handle().await {
                    Ok(handle) => Ok(handle.is_valid()),
                    Err(RuntimeError::NotFound(_)) => Ok(false),
                    Err(e) => Err(e.into_lua_err()),
                }
            }
        });

        methods.add_async_method("own_properties", |lua, this, ()| {
            let this = ObjectRef::clone(&this);
            async move {
                let handle = this.handle().await.into_lua_err()?;
                names(&lua, handle.own_properties().into_keys())
            }
        });

        methods.add_async_method("own_methods", |lua, this, ()| {
            let this = ObjectRef::clone(&this);
            async move {
                let handle = this.handle().await.into_lua_err()?;
                names(&lua, handle.own_methods().into_keys())
            }
        });

        // obj.prop reads a property; obj.name / obj:name(...) reaches a method
        methods.add_async_meta_method(MetaMethod::Index, |lua, this, key: LuaValue| {
            let this = ObjectRef::clone(&this);
            async move {
                let LuaValue::String(key) = key else {
                    return Ok(LuaValue::Nil);
                };
                let key = key.to_str()?.to_string();
                let handle = this.handle().await.into_lua_err()?;
                if let Some(value) = handle.get(&key).await.into_lua_err()? {
                    return to_lua(&lua, &value, &this.manager);
                }
                if handle.has_method_async(&key).await.into_lua_err()? {
                    return Ok(LuaValue::Function(bound_method(&lua, &this, &key)?));
                }
                Ok(LuaValue::Nil)
            }
        });

        // obj.prop = value writes locally; assigning nil removes
        methods.add_async_meta_method(
            MetaMethod::NewIndex,
            |_, this, (key, value): (String, LuaValue)| {
                let this = ObjectRef::clone(&this);
                async move {
                    let handle = this.handle().await.into_lua_err()?;
                    if matches!(value, LuaValue::Nil) {
                        handle.remove(&key).await.into_lua_err()?;
                    } else {
                        handle.set(&key, from_lua(value)?).await.into_lua_err()?;
                    }
                    Ok(())
                }
            },
        );

        methods.add_meta_method(MetaMethod::Eq, |_, this, other: LuaValue| {
            Ok(object_id(&other) == Some(this.id))
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("#{}", this.id))
        });
    }
}

/// The `world` binding: object lifecycle and alias lookup
#[derive(Clone)]
pub struct WorldRef {
    manager: WeakManager,
}

impl WorldRef {
    pub fn new(manager: WeakManager) -> Self {
        Self { manager }
    }

    fn object(&self, id: ObjectId) -> ObjectRef {
        ObjectRef::new(id, self.manager.clone())
    }
}

impl UserData for WorldRef {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_async_method("load", |_, this, target: LuaValue| {
            let this = WorldRef::clone(&this);
            async move {
                let id = require_object(&target)?;
                let manager = this.manager.upgrade().into_lua_err()?;
                manager.load(id).await.into_lua_err()?;
                Ok(this.object(id))
            }
        });

        methods.add_async_method(
            "create",
            |_, this, (parent, properties): (LuaValue, Option<Table>)| {
                let this = WorldRef::clone(&this);
                async move {
                    let parent = match parent {
                        LuaValue::Nil => Some(ROOT_ID),
                        other => Some(require_object(&other)?),
                    };
                    let properties: Properties = match properties {
                        Some(table) => match from_lua(LuaValue::Table(table))? {
                            Value::Map(map) => map,
                            Value::List(items) if items.is_empty() => Properties::new(),
                            _ => {
                                return Err(mlua::Error::runtime(
                                    "create(): properties must be a table of names",
                                ))
                            }
                        },
                        None => Properties::new(),
                    };
                    let manager = this.manager.upgrade().into_lua_err()?;
                    let handle = manager
                        .create(parent, properties, Default::default())
                        .await
                        .into_lua_err()?;
                    Ok(this.object(handle.id()))
                }
            },
        );

        methods.add_async_method("recycle", |_, this, target: LuaValue| {
            let this = WorldRef::clone(&this);
            async move {
                let id = require_object(&target)?;
                let manager = this.manager.upgrade().into_lua_err()?;
                let handle = manager.load(id).await.into_lua_err()?;
                manager.recycle(&handle).await.into_lua_err()
            }
        });

        methods.add_async_method("alias", |_, this, (name, target): (String, LuaValue)| {
            let this = WorldRef::clone(&this);
            async move {
                let id = require_object(&target)?;
                let manager = this.manager.upgrade().into_lua_err()?;
                let handle = manager.load(id).await.into_lua_err()?;
                manager.register_alias(&name, &handle).await.into_lua_err()
            }
        });

        methods.add_async_method("unalias", |_, this, name: String| {
            let this = WorldRef::clone(&this);
            async move {
                let manager = this.manager.upgrade().into_lua_err()?;
                let removed = manager.remove_alias(&name).await.into_lua_err()?;
                Ok(removed.is_some())
            }
        });

        methods.add_method("aliases", |lua, this, ()| {
            let manager = this.manager.upgrade().into_lua_err()?;
            let table = lua.create_table()?;
            for (name, id) in manager.aliases() {
                table.set(name, this.object(id))?;
            }
            Ok(table)
        });

        methods.add_async_method("find", |_, this, (key, value): (String, LuaValue)| {
            let this = WorldRef::clone(&this);
            async move {
                let value = from_lua(value)?;
                let manager = this.manager.upgrade().into_lua_err()?;
                let found = manager
                    .find_by_property(&key, &value)
                    .await
                    .into_lua_err()?;
                Ok(found.map(|h| this.object(h.id())))
            }
        });

        // Direct access: world.lobby and world[5] only reach resident
        // objects; world:load is the loading path
        methods.add_meta_method(MetaMethod::Index, |_, this, key: LuaValue| match key {
            LuaValue::Integer(id) => {
                let manager = this.manager.upgrade().into_lua_err()?;
                let handle = manager.cached(id).into_lua_err()?;
                Ok(this.object(handle.id()))
            }
            LuaValue::String(name) => {
                let name = name.to_str()?.to_string();
                let manager = this.manager.upgrade().into_lua_err()?;
                let handle = manager.alias(&name).into_lua_err()?;
                Ok(this.object(handle.id()))
            }
            other => Err(mlua::Error::runtime(format!(
                "cannot index world with {}",
                other.type_name()
            ))),
        });
    }
}

/// The `context` binding: the session a call originated from
pub struct ContextRef {
    session: Rc<dyn SessionContext>,
    manager: WeakManager,
}

impl ContextRef {
    pub fn new(session: Rc<dyn SessionContext>, manager: WeakManager) -> Self {
        Self { session, manager }
    }
}

impl UserData for ContextRef {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("id", |_, this| Ok(this.session.id().to_string()));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("send", |_, this, text: LuaValue| {
            let text = match text {
                LuaValue::String(s) => s.to_str()?.to_string(),
                other => from_lua(other)?.to_string(),
            };
            this.session.send(&text);
            Ok(())
        });

        methods.add_method("player", |_, this, ()| {
            Ok(this
                .session
                .player()
                .map(|id| ObjectRef::new(id, this.manager.clone())))
        });

        methods.add_method("set_player", |_, this, player: LuaValue| {
            this.session.set_player(optional_object(&player)?);
            Ok(())
        });
    }
}

/// Build the userdata value for an object reference
pub fn object_value(lua: &Lua, id: ObjectId, manager: &WeakManager) -> LuaResult<AnyUserData> {
    lua.create_userdata(ObjectRef::new(id, manager.clone()))
}
