//! In-memory alias registry
//!
//! Holds `name -> id` bindings. The manager rebuilds it from the alias holder
//! record at startup and persists it back after every mutation.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::codec::TypedValue;
use super::ObjectId;
use crate::error::{Result, RuntimeError};

/// Aliases double as Lua field names (`world.lobby`), so they must be identifiers
static ALIAS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap());

/// Validate an alias name
pub fn validate_alias(name: &str) -> Result<()> {
    if ALIAS_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(RuntimeError::InvalidAlias(name.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AliasRegistry {
    bindings: BTreeMap<String, ObjectId>,
}

impl AliasRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the persisted map; entries that are not object refs are skipped
    pub fn from_stored(stored: Option<&TypedValue>) -> Self {
        let mut registry = Self::new();
        if let Some(TypedValue::Object(map)) = stored {
            for (name, value) in map {
                if let TypedValue::ObjRef(id) = value {
                    registry.bindings.insert(name.clone(), *id);
                }
            }
        }
        registry
    }

    /// Encode for persistence on the alias holder
    pub fn to_stored(&self) -> TypedValue {
        TypedValue::Object(
            self.bindings
                .iter()
                .map(|(name, id)| (name.clone(), TypedValue::ObjRef(*id)))
                .collect(),
        )
    }

    /// Bind a name, returning the id it previously pointed at
    pub fn register(&mut self, name: &str, id: ObjectId) -> Option<ObjectId> {
        self.bindings.insert(name.to_string(), id)
    }

    pub fn remove(&mut self, name: &str) -> Option<ObjectId> {
        self.bindings.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<ObjectId> {
        self.bindings.get(name).copied()
    }

    /// Drop every alias bound to `id`, returning the removed names
    pub fn remove_target(&mut self, id: ObjectId) -> Vec<String> {
        let names: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, target)| **target == id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            self.bindings.remove(name);
        }
        names
    }

    /// Keep only bindings whose target passes `keep`, returning the dropped names
    pub fn retain(&mut self, mut keep: impl FnMut(ObjectId) -> bool) -> Vec<String> {
        let mut dropped = Vec::new();
        self.bindings.retain(|name, id| {
            let ok = keep(*id);
            if !ok {
                dropped.push(name.clone());
            }
            ok
        });
        dropped
    }

    /// Snapshot of all bindings, ordered by name
    pub fn snapshot(&self) -> BTreeMap<String, ObjectId> {
        self.bindings.clone()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
