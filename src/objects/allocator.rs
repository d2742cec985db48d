//! Recycling id allocator
//!
//! Freed ids are handed out lowest-first before fresh ids past the highest
//! id ever used. Ids of recycled records stay reserved until reallocated, so
//! the free-list can be rebuilt from the store's tombstones at startup.

use std::collections::BTreeSet;

use super::ObjectId;

#[derive(Debug, Clone, Default)]
pub struct RecyclingAllocator {
    free: BTreeSet<ObjectId>,
    next: ObjectId,
}

impl RecyclingAllocator {
    /// Rebuild from durable state: the highest id in the store and the
    /// ids of recycled records
    pub fn from_store(max_id: Option<ObjectId>, recycled: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            free: recycled.into_iter().collect(),
            next: max_id.map_or(0, |m| m + 1),
        }
    }

    /// Take the lowest free id, or the next fresh one
    pub fn allocate(&mut self) -> ObjectId {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Return an id to the free-list
    pub fn release(&mut self, id: ObjectId) {
        if id < self.next {
            self.free.insert(id);
        }
    }

    /// Note an id created outside the allocator (e.g. the reserved roots)
    pub fn observe(&mut self, id: ObjectId) {
        self.free.remove(&id);
        if id >= self.next {
            self.next = id + 1;
        }
    }

    /// Free ids in the order they will be handed out
    pub fn free_ids(&self) -> Vec<ObjectId> {
        self.free.iter().copied().collect()
    }

    /// The id a fresh allocation would use once the free-list is empty
    pub fn next_fresh(&self) -> ObjectId {
        self.next
    }
}
