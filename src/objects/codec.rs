//! Typed value codec
//!
//! Property values live in two shapes:
//! - [`Value`]: what callers read and write (object references unresolved)
//! - [`TypedValue`]: the tagged, storage-safe form persisted as JSON
//!
//! Every node carries its own tag, so an integer that happens to equal an
//! object id can never be mistaken for a reference.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{ObjectHandle, ObjectId, ObjectManager};
use crate::error::Result;

/// Tagged storage representation of a property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TypedValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    ObjRef(ObjectId),
    Array(Vec<TypedValue>),
    Object(BTreeMap<String, TypedValue>),
}

/// A reference to another object, resolved through the manager on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub ObjectId);

impl ObjRef {
    pub fn id(&self) -> ObjectId {
        self.0
    }

    /// Load the referenced object (cache first, then store)
    pub async fn resolve(&self, manager: &ObjectManager) -> Result<ObjectHandle> {
        manager.load(self.0).await
    }
}

/// Runtime property value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ref(ObjRef),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Encode a runtime value into its tagged storage form
pub fn encode(value: &Value) -> TypedValue {
    match value {
        Value::Null => TypedValue::Null,
        Value::Bool(b) => TypedValue::Boolean(*b),
        Value::Int(i) => TypedValue::Integer(*i),
        Value::Float(f) => TypedValue::Number(*f),
        Value::Str(s) => TypedValue::String(s.clone()),
        Value::Ref(r) => TypedValue::ObjRef(r.0),
        Value::List(items) => TypedValue::Array(items.iter().map(encode).collect()),
        Value::Map(map) => TypedValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), encode(v)))
                .collect(),
        ),
    }
}

/// Decode a stored value; references stay as lazy [`ObjRef`]s
pub fn decode(typed: &TypedValue) -> Value {
    match typed {
        TypedValue::Null => Value::Null,
        TypedValue::Boolean(b) => Value::Bool(*b),
        TypedValue::Integer(i) => Value::Int(*i),
        TypedValue::Number(f) => Value::Float(*f),
        TypedValue::String(s) => Value::Str(s.clone()),
        TypedValue::ObjRef(id) => Value::Ref(ObjRef(*id)),
        TypedValue::Array(items) => Value::List(items.iter().map(decode).collect()),
        TypedValue::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), decode(v)))
                .collect(),
        ),
    }
}

impl Value {
    /// Import untagged JSON; JSON has no reference type, so none are produced
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_objref(&self) -> Option<ObjRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Ref(r) => write!(f, "#{}", r.0),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Value::Ref(r)
    }
}

impl From<&ObjectHandle> for Value {
    fn from(handle: &ObjectHandle) -> Self {
        Value::Ref(ObjRef(handle.id()))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
