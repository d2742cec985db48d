//! Conversion between runtime values and Lua values

use std::collections::BTreeMap;

use mlua::{ExternalError, Lua, MultiValue, Result as LuaResult, Value as LuaValue};

use super::bindings::ObjectRef;
use crate::error::RuntimeError;
use crate::objects::{ObjRef, Value, WeakManager};

/// Tables nested deeper than this are rejected (and cycles with them)
const MAX_DEPTH: usize = 32;

fn unsupported(what: impl Into<String>) -> mlua::Error {
    RuntimeError::UnsupportedValue(what.into()).into_lua_err()
}

/// Convert a runtime value for use inside a method body.
/// Object references become live `ObjectRef` userdata.
pub fn to_lua(lua: &Lua, value: &Value, manager: &WeakManager) -> LuaResult<LuaValue> {
    match value {
        Value::Null => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Int(i) => Ok(LuaValue::Integer(*i)),
        Value::Float(f) => Ok(LuaValue::Number(*f)),
        Value::Str(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        Value::Ref(r) => Ok(LuaValue::UserData(
            lua.create_userdata(ObjectRef::new(r.id(), manager.clone()))?,
        )),
        Value::List(items) => {
            let table = lua.create_table()?;
            for (i, v) in items.iter().enumerate() {
                table.set(i + 1, to_lua(lua, v, manager)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        Value::Map(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), to_lua(lua, v, manager)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value back into a storable runtime value.
/// Tables whose keys are exactly `1..=n` become lists (the empty table
/// included); any other table, sparse ones too, becomes a map.
pub fn from_lua(value: LuaValue) -> LuaResult<Value> {
    from_lua_at(value, 0)
}

/// Convert a call's variadic arguments
pub fn args_from_lua(values: MultiValue) -> LuaResult<Vec<Value>> {
    values.into_iter().map(from_lua).collect()
}

fn from_lua_at(value: LuaValue, depth: usize) -> LuaResult<Value> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(b)),
        LuaValue::Integer(i) => Ok(Value::Int(i)),
        LuaValue::Number(n) => Ok(Value::Float(n)),
        LuaValue::String(s) => Ok(Value::Str(s.to_str()?.to_string())),
        LuaValue::UserData(ud) => match ud.borrow::<ObjectRef>() {
            Ok(obj) => Ok(Value::Ref(ObjRef(obj.id))),
            Err(_) => Err(unsupported("userdata")),
        },
        LuaValue::Table(t) => {
            if depth >= MAX_DEPTH {
                return Err(unsupported("table nested too deeply"));
            }

            // A list only when the integer keys are exactly 1..=n; sparse
            // tables become maps so conversion stays linear in entry count
            let mut is_array = true;
            let mut max_idx = 0i64;
            let mut count = 0i64;
            for pair in t.clone().pairs::<LuaValue, LuaValue>() {
                let (k, _) = pair?;
                count += 1;
                match k {
                    LuaValue::Integer(i) if i > 0 => max_idx = max_idx.max(i),
                    _ => is_array = false,
                }
            }

            if is_array && max_idx == count {
                let mut items = Vec::with_capacity(count as usize);
                for i in 1..=max_idx {
                    let v: LuaValue = t.get(i)?;
                    items.push(from_lua_at(v, depth + 1)?);
                }
                Ok(Value::List(items))
            } else {
                let mut map = BTreeMap::new();
                for pair in t.pairs::<LuaValue, LuaValue>() {
                    let (k, v) = pair?;
                    let key = match k {
                        LuaValue::String(s) => s.to_str()?.to_string(),
                        LuaValue::Integer(i) => i.to_string(),
                        other => return Err(unsupported(format!("{} table key", other.type_name()))),
                    };
                    map.insert(key, from_lua_at(v, depth + 1)?);
                }
                Ok(Value::Map(map))
            }
        }
        other => Err(unsupported(other.type_name())),
    }
}
