//! Object system - prototype objects with live inheritance

mod aliases;
mod allocator;
mod codec;
mod gate;
mod handle;
mod manager;
mod record;
mod scope;
mod store;

use std::collections::BTreeMap;

pub use aliases::{validate_alias, AliasRegistry};
pub use allocator::RecyclingAllocator;
pub use codec::{decode, encode, ObjRef, TypedValue, Value};
pub use gate::{CallGate, GateGuard};
pub use handle::ObjectHandle;
pub use manager::{ObjectManager, WeakManager};
pub use record::{
    hash_source, MethodDef, MethodOptions, Methods, ObjectId, ObjectRecord, StoredProperties,
    ALIAS_HOLDER_ID, ALIAS_PROPERTY, ROOT_ID,
};
pub use scope::{CallOptions, CallScope};
pub use store::{ObjectStore, Scan};

/// Decoded property map, as supplied to `create`
pub type Properties = BTreeMap<String, Value>;
