//! Runtime object handle
//!
//! A live wrapper over one cached record. Property reads and method
//! resolution walk the parent chain through the manager; writes always land
//! on this object and are persisted before the writing call returns.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use super::codec::{decode, encode, TypedValue};
use super::gate::CallGate;
use super::manager::{ObjectManager, WeakManager};
use super::scope::{CallOptions, CallScope};
use super::{MethodDef, MethodOptions, Methods, ObjectId, ObjectRecord, ObjectStore, Value};
use crate::error::{Result, RuntimeError};
use crate::script::{Invocation, MethodSite};

/// Shared handle to one object; clones refer to the same instance
#[derive(Clone)]
pub struct ObjectHandle {
    inner: Rc<HandleInner>,
}

struct HandleInner {
    id: ObjectId,
    record: RefCell<ObjectRecord>,
    store: ObjectStore,
    manager: WeakManager,
    gate: CallGate,
    /// Serializes persistence so snapshots reach the store in order
    writes: tokio::sync::Mutex<()>,
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.inner.id)
            .field("parent", &self.parent())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl ObjectHandle {
    pub(crate) fn new(record: ObjectRecord, store: ObjectStore, manager: WeakManager) -> Self {
        Self {
            inner: Rc::new(HandleInner {
                id: record.id,
                record: RefCell::new(record),
                store,
                manager,
                gate: CallGate::new(),
                writes: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Whether two handles are the same cached instance
    pub fn ptr_eq(a: &ObjectHandle, b: &ObjectHandle) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// False once the object has been recycled
    pub fn is_valid(&self) -> bool {
        self.inner.record.borrow().is_live()
    }

    pub fn version(&self) -> i64 {
        self.inner.record.borrow().version
    }

    /// Snapshot of the underlying record
    pub fn record(&self) -> ObjectRecord {
        self.inner.record.borrow().clone()
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.inner.record.borrow().parent
    }

    pub(crate) fn manager(&self) -> Result<ObjectManager> {
        self.inner.manager.upgrade()
    }

    // ---- properties ----

    /// Locally defined property, decoded (references stay unresolved)
    pub fn get_own(&self, prop: &str) -> Option<Value> {
        self.inner.record.borrow().properties.get(prop).map(decode)
    }

    /// Look up `prop` on this object, then each ancestor toward the root.
    /// `None` means no object in the chain defines it.
    pub async fn get(&self, prop: &str) -> Result<Option<Value>> {
        let manager = self.manager()?;
        let mut current = self.clone();
        let mut seen = HashSet::new();
        loop {
            if !seen.insert(current.id()) {
                return Err(RuntimeError::InheritanceCycle(current.id()));
            }
            if let Some(value) = current.get_own(prop) {
                return Ok(Some(value));
            }
            match current.ancestor(&manager).await? {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
    }

    /// Write a property on this object (never on an ancestor)
    pub async fn set(&self, prop: &str, value: impl Into<Value>) -> Result<()> {
        let typed = encode(&value.into());
        self.mutate(|record| {
            record.properties.insert(prop.to_string(), typed);
        })
        .await
    }

    /// Delete a local property, re-exposing any inherited value
    pub async fn remove(&self, prop: &str) -> Result<bool> {
        if !self.inner.record.borrow().properties.contains_key(prop) {
            return Ok(false);
        }
        self.mutate(|record| {
            record.properties.remove(prop);
        })
        .await?;
        Ok(true)
    }

    /// Locally defined properties only
    pub fn own_properties(&self) -> BTreeMap<String, Value> {
        self.inner
            .record
            .borrow()
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), decode(v)))
            .collect()
    }

    pub(crate) async fn set_stored(&self, prop: &str, typed: TypedValue) -> Result<()> {
        self.mutate(|record| {
            record.properties.insert(prop.to_string(), typed);
        })
        .await
    }

    // ---- methods ----

    /// Locally defined methods only
    pub fn own_methods(&self) -> Methods {
        self.inner.record.borrow().methods.clone()
    }

    pub fn own_method(&self, name: &str) -> Option<MethodDef> {
        self.inner.record.borrow().methods.get(name).cloned()
    }

    fn defines(&self, name: &str) -> bool {
        self.inner.record.borrow().methods.contains_key(name)
    }

    /// Cache-only capability check. May report false when an ancestor that
    /// defines the method is not resident; use [`has_method_async`] when it matters.
    ///
    /// [`has_method_async`]: ObjectHandle::has_method_async
    pub fn has_method(&self, name: &str) -> bool {
        let Ok(manager) = self.manager() else {
            return self.defines(name);
        };
        let mut current = self.clone();
        let mut seen = HashSet::new();
        loop {
            if current.defines(name) {
                return true;
            }
            if !seen.insert(current.id()) {
                return false;
            }
            match current.parent().map(|pid| manager.cached(pid)) {
                Some(Ok(parent)) => current = parent,
                _ => return false,
            }
        }
    }

    /// Authoritative capability check, loading ancestors as needed
    pub async fn has_method_async(&self, name: &str) -> Result<bool> {
        Ok(!self.resolve_method(name).await?.is_empty())
    }

    /// Attach or replace a method; only this method's compiled code is dropped
    pub async fn set_method(&self, name: &str, source: &str, options: MethodOptions) -> Result<()> {
        let def = MethodDef::with_options(source, options);
        self.mutate(|record| {
            record.methods.insert(name.to_string(), def);
        })
        .await?;
        if let Ok(manager) = self.manager() {
            manager.engine().invalidate(self.id(), name);
        }
        debug!(object = self.id(), method = name, "method source updated");
        Ok(())
    }

    pub async fn remove_method(&self, name: &str) -> Result<bool> {
        if !self.defines(name) {
            return Ok(false);
        }
        self.mutate(|record| {
            record.methods.remove(name);
        })
        .await?;
        if let Ok(manager) = self.manager() {
            manager.engine().invalidate(self.id(), name);
        }
        Ok(true)
    }

    /// Every definer of `name` from this object toward the root
    pub async fn resolve_method(&self, name: &str) -> Result<Vec<MethodSite>> {
        let sites = self
            .lineage()
            .await?
            .into_iter()
            .filter_map(|object| {
                object.own_method(name).map(|def| MethodSite {
                    definer: object.id(),
                    source: def.source,
                })
            })
            .collect();
        Ok(sites)
    }

    /// Find the callable method answering to a command verb
    pub async fn resolve_command(&self, verb: &str) -> Result<Option<String>> {
        for object in self.lineage().await? {
            let found = object
                .inner
                .record
                .borrow()
                .methods
                .iter()
                .find(|(name, def)| def.answers_to(name, verb))
                .map(|(name, _)| name.clone());
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Call a method with default options
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with(method, args, CallOptions::default()).await
    }

    /// Call a method. Outside any method body this starts a new call chain;
    /// inside one it joins the running chain.
    pub async fn call_with(&self, method: &str, args: Vec<Value>, options: CallOptions) -> Result<Value> {
        let manager = self.manager()?;
        let scope = match CallScope::current() {
            Some(outer) => outer.nested(options),
            None => CallScope::top_level(manager.next_chain_id(), options),
        };
        scope
            .clone()
            .enter(self.dispatch(&manager, method, args, scope))
            .await
    }

    async fn dispatch(
        &self,
        manager: &ObjectManager,
        method: &str,
        args: Vec<Value>,
        scope: CallScope,
    ) -> Result<Value> {
        if scope.expired() {
            return Err(RuntimeError::DeadlineExceeded);
        }
        if !self.is_valid() {
            return Err(RuntimeError::NotFound(self.id()));
        }

        let sites = self.resolve_method(method).await?;
        if sites.is_empty() {
            return Err(RuntimeError::MethodNotFound {
                object: self.id(),
                method: method.to_string(),
            });
        }

        let _gate = self.inner.gate.enter(scope.chain, scope.deadline).await?;
        debug!(
            object = self.id(),
            method,
            chain = scope.chain,
            definer = sites[0].definer,
            "dispatching method"
        );

        let engine = manager.engine();
        engine
            .invoke(manager, Invocation::new(self.clone(), method, sites, args))
            .await
    }

    // ---- inheritance ----

    /// Parent handle; a missing or recycled parent ends the chain
    pub async fn parent_handle(&self) -> Result<Option<ObjectHandle>> {
        let manager = self.manager()?;
        self.ancestor(&manager).await
    }

    async fn ancestor(&self, manager: &ObjectManager) -> Result<Option<ObjectHandle>> {
        let Some(parent) = self.parent() else {
            return Ok(None);
        };
        match manager.load(parent).await {
            Ok(handle) => Ok(Some(handle)),
            Err(RuntimeError::NotFound(_)) => {
                warn!(object = self.id(), parent, "parent is missing or recycled; treating as root");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// This object followed by its ancestors, root last
    pub async fn lineage(&self) -> Result<Vec<ObjectHandle>> {
        let manager = self.manager()?;
        let mut chain = vec![self.clone()];
        let mut seen = HashSet::from([self.id()]);
        let mut current = self.clone();
        while let Some(parent) = current.ancestor(&manager).await? {
            if !seen.insert(parent.id()) {
                return Err(RuntimeError::InheritanceCycle(parent.id()));
            }
            chain.push(parent.clone());
            current = parent;
        }
        Ok(chain)
    }

    /// Re-parent this object; rejects missing parents and cycles
    pub async fn set_parent(&self, parent: Option<ObjectId>) -> Result<()> {
        if let Some(pid) = parent {
            if pid == self.id() {
                return Err(RuntimeError::InheritanceCycle(pid));
            }
            let manager = self.manager()?;
            let new_parent = manager.load(pid).await?;
            if new_parent.lineage().await?.iter().any(|a| a.id() == self.id()) {
                return Err(RuntimeError::InheritanceCycle(self.id()));
            }
        }
        self.mutate(|record| record.parent = parent).await
    }

    // ---- persistence ----

    /// Apply `change` to a copy of the record, persist it with a version
    /// check, then publish it. On failure the cached record is untouched.
    /// A recycled handle never writes: its id may already belong to a new
    /// object whose version has caught up with this stale copy.
    pub(crate) async fn mutate<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut ObjectRecord),
    {
        self.write(change, false).await
    }

    async fn write<F>(&self, change: F, tombstoning: bool) -> Result<()>
    where
        F: FnOnce(&mut ObjectRecord),
    {
        let _writing = self.inner.writes.lock().await;
        if !tombstoning && !self.is_valid() {
            return Err(RuntimeError::NotFound(self.id()));
        }

        let mut next = self.inner.record.borrow().clone();
        let expected = next.version;
        change(&mut next);
        next.version = expected + 1;
        next.touch();

        if !self.inner.store.update(&next, expected).await? {
            warn!(object = self.id(), version = expected, "lost update detected");
            return Err(RuntimeError::Conflict(self.id()));
        }

        *self.inner.record.borrow_mut() = next;
        Ok(())
    }

    /// Mark this record recycled (tombstone)
    pub(crate) async fn mark_recycled(&self) -> Result<()> {
        self.write(|record| record.recycled = true, true).await
    }

    /// Reload the record from the store, discarding the cached copy
    pub async fn refresh(&self) -> Result<()> {
        let _writing = self.inner.writes.lock().await;
        if !self.is_valid() {
            return Err(RuntimeError::NotFound(self.id()));
        }
        let record = self
            .inner
            .store
            .get(self.id())
            .await?
            .ok_or(RuntimeError::NotFound(self.id()))?;
        *self.inner.record.borrow_mut() = record;
        Ok(())
    }

    /// Wait for any in-flight write to reach the store
    pub(crate) async fn settle(&self) {
        drop(self.inner.writes.lock().await);
    }
}
