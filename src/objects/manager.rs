//! Object manager: the single entry point to the object space
//!
//! Owns the identity-preserving cache, the alias registry and the id
//! allocator. At most one live handle exists per id; every path that
//! produces a handle goes through the cache.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use super::aliases::{validate_alias, AliasRegistry};
use super::allocator::RecyclingAllocator;
use super::codec::encode;
use super::handle::ObjectHandle;
use super::store::{ObjectStore, Scan};
use super::{
    Methods, ObjectId, ObjectRecord, Properties, Value, ALIAS_HOLDER_ID, ALIAS_PROPERTY, ROOT_ID,
};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::lua::LuaEngine;
use crate::script::ScriptEngine;

/// Cheap, clonable reference to the object space
#[derive(Clone)]
pub struct ObjectManager {
    inner: Rc<ManagerInner>,
}

/// Non-owning reference held by handles and script bindings
#[derive(Clone, Default)]
pub struct WeakManager(Weak<ManagerInner>);

impl WeakManager {
    pub fn upgrade(&self) -> Result<ObjectManager> {
        let inner = self.0.upgrade().ok_or(RuntimeError::ShutDown)?;
        if inner.closed.get() {
            return Err(RuntimeError::ShutDown);
        }
        Ok(ObjectManager { inner })
    }
}

struct ManagerInner {
    store: ObjectStore,
    config: RuntimeConfig,
    engine: Rc<dyn ScriptEngine>,
    cache: RefCell<HashMap<ObjectId, ObjectHandle>>,
    aliases: RefCell<AliasRegistry>,
    allocator: RefCell<RecyclingAllocator>,
    chains: Cell<u64>,
    closed: Cell<bool>,
}

impl ObjectManager {
    /// Open the object space with the Lua engine
    pub async fn open(store: ObjectStore, config: RuntimeConfig) -> anyhow::Result<Self> {
        let engine = LuaEngine::new(config.sandbox()).map_err(|e| anyhow::anyhow!("{e}"))?;
        Self::open_with_engine(store, config, Rc::new(engine)).await
    }

    /// Open the object space with a caller-supplied engine
    pub async fn open_with_engine(
        store: ObjectStore,
        config: RuntimeConfig,
        engine: Rc<dyn ScriptEngine>,
    ) -> anyhow::Result<Self> {
        store.ensure_alias_holder().await?;
        store.ensure_root().await?;

        let allocator =
            RecyclingAllocator::from_store(store.max_id().await?, store.recycled_ids().await?);
        let next_fresh = allocator.next_fresh();

        let manager = Self {
            inner: Rc::new(ManagerInner {
                store,
                config,
                engine,
                cache: RefCell::new(HashMap::new()),
                aliases: RefCell::new(AliasRegistry::new()),
                allocator: RefCell::new(allocator),
                chains: Cell::new(0),
                closed: Cell::new(false),
            }),
        };

        // #0 stays resident for the manager's lifetime
        manager.load(ALIAS_HOLDER_ID).await?;
        let aliases = manager.reload_aliases().await?;

        info!(
            engine = manager.inner.engine.dialect(),
            aliases = aliases.len(),
            next_fresh,
            "Object manager ready"
        );
        Ok(manager)
    }

    pub fn downgrade(&self) -> WeakManager {
        WeakManager(Rc::downgrade(&self.inner))
    }

    pub fn store(&self) -> &ObjectStore {
        &self.inner.store
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> Rc<dyn ScriptEngine> {
        self.inner.engine.clone()
    }

    pub(crate) fn next_chain_id(&self) -> u64 {
        let next = self.inner.chains.get() + 1;
        self.inner.chains.set(next);
        next
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(RuntimeError::ShutDown);
        }
        Ok(())
    }

    fn adopt(&self, record: ObjectRecord) -> ObjectHandle {
        ObjectHandle::new(record, self.inner.store.clone(), self.downgrade())
    }

    // ---- lifecycle ----

    /// Create an object, reusing the lowest recycled id when one is free
    pub async fn create(
        &self,
        parent: Option<ObjectId>,
        properties: Properties,
        methods: Methods,
    ) -> Result<ObjectHandle> {
        self.ensure_open()?;
        if let Some(pid) = parent {
            self.load(pid).await?;
        }

        let id = self.inner.allocator.borrow_mut().allocate();
        let mut record = ObjectRecord::new(id, parent);
        record.properties = properties
            .iter()
            .map(|(k, v)| (k.clone(), encode(v)))
            .collect();
        record.methods = methods;

        if let Err(e) = self.inner.store.put(&record).await {
            self.inner.allocator.borrow_mut().release(id);
            return Err(e.into());
        }

        let handle = self.adopt(record);
        self.inner.cache.borrow_mut().insert(id, handle.clone());
        debug!(id, ?parent, "Created object");
        Ok(handle)
    }

    /// Load an object, returning the cached instance when resident
    pub async fn load(&self, id: ObjectId) -> Result<ObjectHandle> {
        self.ensure_open()?;
        let cached = self.inner.cache.borrow().get(&id).cloned();
        if let Some(handle) = cached {
            return Ok(handle);
        }

        let record = match self.inner.store.get(id).await? {
            Some(record) if record.is_live() => record,
            _ => return Err(RuntimeError::NotFound(id)),
        };

        // Another task may have loaded the same id while we were reading
        let handle = self
            .inner
            .cache
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| self.adopt(record))
            .clone();
        Ok(handle)
    }

    /// Tombstone an object and return its id to the free list
    pub async fn recycle(&self, handle: &ObjectHandle) -> Result<()> {
        self.ensure_open()?;
        let id = handle.id();
        if id == ROOT_ID || id == ALIAS_HOLDER_ID {
            return Err(RuntimeError::Protected(id));
        }
        if !handle.is_valid() {
            return Err(RuntimeError::NotFound(id));
        }

        handle.mark_recycled().await?;
        self.inner.cache.borrow_mut().remove(&id);
        for method in handle.own_methods().keys() {
            self.inner.engine.invalidate(id, method);
        }

        let dropped = self.inner.aliases.borrow_mut().remove_target(id);
        if !dropped.is_empty() {
            self.persist_aliases().await?;
        }

        self.inner.allocator.borrow_mut().release(id);
        info!(id, aliases = ?dropped, "Recycled object");
        Ok(())
    }

    // ---- cache ----

    /// Direct reference: resident handles only
    pub fn cached(&self, id: ObjectId) -> Result<ObjectHandle> {
        self.inner
            .cache
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::HandleNotCached(id))
    }

    pub fn is_cached(&self, id: ObjectId) -> bool {
        self.inner.cache.borrow().contains_key(&id)
    }

    pub fn cached_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.inner.cache.borrow().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Warm the cache; ids that do not resolve are skipped
    pub async fn preload(&self, ids: &[ObjectId]) -> Result<usize> {
        let mut loaded = 0;
        for &id in ids {
            match self.load(id).await {
                Ok(_) => loaded += 1,
                Err(RuntimeError::NotFound(_)) => {
                    warn!(id, "Skipping preload of missing object");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }

    /// Drop a handle from the cache once its pending writes are stored.
    /// The alias holder is pinned and never evicted.
    pub async fn evict(&self, id: ObjectId) -> bool {
        if id == ALIAS_HOLDER_ID {
            return false;
        }
        let handle = self.inner.cache.borrow().get(&id).cloned();
        match handle {
            Some(handle) => {
                handle.settle().await;
                self.inner.cache.borrow_mut().remove(&id).is_some()
            }
            None => false,
        }
    }

    /// Release every handle and refuse further work
    pub fn shutdown(&self) {
        self.inner.closed.set(true);
        self.inner.cache.borrow_mut().clear();
        self.inner.aliases.borrow_mut().clear();
        info!("Object manager shut down");
    }

    // ---- aliases ----

    /// Bind `name` to a live object and persist the registry
    pub async fn register_alias(&self, name: &str, handle: &ObjectHandle) -> Result<()> {
        self.ensure_open()?;
        validate_alias(name)?;
        if !handle.is_valid() {
            return Err(RuntimeError::NotFound(handle.id()));
        }

        let previous = self
            .inner
            .aliases
            .borrow_mut()
            .register(name, handle.id());
        if let Err(e) = self.persist_aliases().await {
            let mut aliases = self.inner.aliases.borrow_mut();
            match previous {
                Some(prev) => {
                    aliases.register(name, prev);
                }
                None => {
                    aliases.remove(name);
                }
            }
            return Err(e);
        }

        debug!(alias = name, id = handle.id(), "Registered alias");
        Ok(())
    }

    /// Unbind `name`; returns the id it pointed at, if it was bound
    pub async fn remove_alias(&self, name: &str) -> Result<Option<ObjectId>> {
        self.ensure_open()?;
        let removed = self.inner.aliases.borrow_mut().remove(name);
        if let Some(id) = removed {
            if let Err(e) = self.persist_aliases().await {
                self.inner.aliases.borrow_mut().register(name, id);
                return Err(e);
            }
        }
        Ok(removed)
    }

    pub fn aliases(&self) -> BTreeMap<String, ObjectId> {
        self.inner.aliases.borrow().snapshot()
    }

    /// Direct alias access: the target must be registered and resident
    pub fn alias(&self, name: &str) -> Result<ObjectHandle> {
        let id = self
            .inner
            .aliases
            .borrow()
            .get(name)
            .ok_or_else(|| RuntimeError::AliasNotRegistered(name.to_string()))?;
        self.cached(id)
    }

    /// Alias access that loads the target when it is not resident
    pub async fn resolve_alias(&self, name: &str) -> Result<ObjectHandle> {
        let id = self
            .inner
            .aliases
            .borrow()
            .get(name)
            .ok_or_else(|| RuntimeError::AliasNotRegistered(name.to_string()))?;
        self.load(id).await
    }

    /// Rebuild the registry from the alias holder, dropping bindings whose
    /// target no longer resolves. Targets are loaded along the way.
    pub async fn reload_aliases(&self) -> Result<BTreeMap<String, ObjectId>> {
        let holder = self.load(ALIAS_HOLDER_ID).await?;
        holder.refresh().await?;
        let mut registry = AliasRegistry::from_stored(holder.record().properties.get(ALIAS_PROPERTY));

        let mut dangling = Vec::new();
        for (name, id) in registry.snapshot() {
            match self.load(id).await {
                Ok(_) => {}
                Err(RuntimeError::NotFound(_)) => dangling.push(name),
                Err(e) => return Err(e),
            }
        }
        for name in &dangling {
            registry.remove(name);
        }

        *self.inner.aliases.borrow_mut() = registry;
        if !dangling.is_empty() {
            warn!(aliases = ?dangling, "Dropped aliases pointing at missing objects");
            self.persist_aliases().await?;
        }
        Ok(self.aliases())
    }

    async fn persist_aliases(&self) -> Result<()> {
        let holder = self.load(ALIAS_HOLDER_ID).await?;
        // Snapshot under the holder's write lock so concurrent updates land in order
        holder
            .mutate(|record| {
                record
                    .properties
                    .insert(ALIAS_PROPERTY.to_string(), self.inner.aliases.borrow().to_stored());
            })
            .await
    }

    // ---- queries ----

    /// First live object, in id order, matching `predicate`
    pub async fn find<P>(&self, predicate: P) -> Result<Option<ObjectHandle>>
    where
        P: Fn(&ObjectHandle) -> bool,
    {
        Ok(self.scan(predicate, true).await?.into_iter().next())
    }

    /// Every live object matching `predicate`, in id order
    pub async fn find_all<P>(&self, predicate: P) -> Result<Vec<ObjectHandle>>
    where
        P: Fn(&ObjectHandle) -> bool,
    {
        self.scan(predicate, false).await
    }

    /// First live object whose own property `key` equals `value`
    pub async fn find_by_property(&self, key: &str, value: &Value) -> Result<Option<ObjectHandle>> {
        self.find(|h| h.get_own(key).as_ref() == Some(value)).await
    }

    async fn scan<P>(&self, predicate: P, first_only: bool) -> Result<Vec<ObjectHandle>>
    where
        P: Fn(&ObjectHandle) -> bool,
    {
        self.ensure_open()?;
        let records = self.inner.store.list_all(Scan::Live).await?;

        let mut matches = Vec::new();
        for record in records {
            // Resident handles may hold writes newer than what the scan read
            let resident = self.inner.cache.borrow().get(&record.id).cloned();
            let handle = resident.unwrap_or_else(|| self.adopt(record));
            if !handle.is_valid() || !predicate(&handle) {
                continue;
            }
            let handle = self
                .inner
                .cache
                .borrow_mut()
                .entry(handle.id())
                .or_insert(handle)
                .clone();
            matches.push(handle);
            if first_only {
                break;
            }
        }
        Ok(matches)
    }
}
