//! Persisted object records and method definitions

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::codec::TypedValue;

/// Integer object identifier (`#1` is the universal ancestor, `#0` holds aliases)
pub type ObjectId = i64;

/// Id of the universal ancestor
pub const ROOT_ID: ObjectId = 1;

/// Id of the record that holds the persisted alias table
pub const ALIAS_HOLDER_ID: ObjectId = 0;

/// Property on the alias holder that stores the `name -> objref` map
pub const ALIAS_PROPERTY: &str = "aliases";

/// Stored properties, already encoded by the codec
pub type StoredProperties = BTreeMap<String, TypedValue>;

/// Methods keyed by name
pub type Methods = BTreeMap<String, MethodDef>;

/// A script method attached to one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Script source (method body)
    pub source: String,
    /// Whether players may invoke this method as a command verb
    #[serde(default)]
    pub callable: bool,
    /// Extra verbs that resolve to this method
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_aliases: Vec<String>,
    /// One-line help text for command listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    /// When the source last changed
    pub modified_at: String,
}

impl MethodDef {
    /// Create a plain (non-command) method
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            callable: false,
            command_aliases: Vec::new(),
            help: None,
            modified_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Create a method with command options applied
    pub fn with_options(source: &str, options: MethodOptions) -> Self {
        Self {
            callable: options.callable,
            command_aliases: options.command_aliases,
            help: options.help,
            ..Self::new(source)
        }
    }

    /// Content hash of the source, used to detect stale compiled code
    pub fn source_hash(&self) -> String {
        hash_source(&self.source)
    }

    /// Whether `verb` invokes this method as a command
    pub fn answers_to(&self, name: &str, verb: &str) -> bool {
        self.callable && (name == verb || self.command_aliases.iter().any(|a| a == verb))
    }
}

/// Optional command metadata for `set_method`
#[derive(Debug, Clone, Default)]
pub struct MethodOptions {
    pub callable: bool,
    pub command_aliases: Vec<String>,
    pub help: Option<String>,
}

impl MethodOptions {
    /// Options for a player-invocable command
    pub fn command(aliases: &[&str]) -> Self {
        Self {
            callable: true,
            command_aliases: aliases.iter().map(|a| a.to_string()).collect(),
            help: None,
        }
    }
}

/// Compute SHA-256 hash of method source
pub fn hash_source(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

/// One persisted object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    /// Prototype this object inherits from; `None` for roots
    pub parent: Option<ObjectId>,
    pub properties: StoredProperties,
    pub methods: Methods,
    /// Tombstone flag; recycled records are never physically removed
    pub recycled: bool,
    /// Optimistic concurrency counter, bumped on every write
    pub version: i64,
    pub created_at: String,
    pub modified_at: String,
}

impl ObjectRecord {
    /// Create a fresh record
    pub fn new(id: ObjectId, parent: Option<ObjectId>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id,
            parent,
            properties: StoredProperties::new(),
            methods: Methods::new(),
            recycled: false,
            version: 0,
            created_at: now.clone(),
            modified_at: now,
        }
    }

    /// Stamp the modification time
    pub fn touch(&mut self) {
        self.modified_at = chrono::Utc::now().to_rfc3339();
    }

    pub fn is_live(&self) -> bool {
        !self.recycled
    }
}
