//! Storage registry
//!
//! Maps storage ids to storages. Ids are either chosen by the caller
//! (`register`) or handed out from a counter (`create(None)`); the counter
//! always stays above every id seen so far.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use epochkv_core::{Error, Result, StorageId};
use tracing::debug;

use crate::storage::Storage;

/// Registry of storages.
#[derive(Debug)]
pub struct StorageRegistry {
    storages: DashMap<StorageId, Arc<Storage>>,
    next_id: AtomicU64,
    wp_capacity: usize,
}

impl StorageRegistry {
    /// Empty registry; new storages get `wp_capacity` reservation slots.
    pub fn new(wp_capacity: usize) -> Self {
        StorageRegistry {
            storages: DashMap::new(),
            next_id: AtomicU64::new(1),
            wp_capacity,
        }
    }

    /// Create a storage, allocating an id when `id` is `None`.
    pub fn create(&self, id: Option<StorageId>) -> Result<StorageId> {
        match id {
            Some(id) => {
                self.insert_new(id)?;
                self.next_id.fetch_max(id.0.saturating_add(1), Ordering::AcqRel);
                Ok(id)
            }
            None => loop {
                let id = StorageId(self.next_id.fetch_add(1, Ordering::AcqRel));
                match self.insert_new(id) {
                    Ok(()) => return Ok(id),
                    Err(Error::StorageAlreadyExists(_)) => continue,
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Register a storage under a caller-chosen id.
    pub fn register(&self, id: StorageId) -> Result<()> {
        self.create(Some(id)).map(|_| ())
    }

    fn insert_new(&self, id: StorageId) -> Result<()> {
        match self.storages.entry(id) {
            Entry::Occupied(_) => Err(Error::StorageAlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Storage::new(id, self.wp_capacity)));
                debug!(target: "epochkv::storage", storage = %id, "created");
                Ok(())
            }
        }
    }

    /// Look up a storage.
    pub fn get(&self, id: StorageId) -> Result<Arc<Storage>> {
        self.storages
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(Error::StorageNotFound(id))
    }

    /// Drop a storage. Refused while a long transaction holds a reservation
    /// on it.
    pub fn delete(&self, id: StorageId) -> Result<Arc<Storage>> {
        match self.storages.entry(id) {
            Entry::Vacant(_) => Err(Error::StorageNotFound(id)),
            Entry::Occupied(slot) => {
                if slot.get().wp().has_reservations() {
                    return Err(Error::StorageInUse(id));
                }
                debug!(target: "epochkv::storage", storage = %id, "deleted");
                Ok(slot.remove())
            }
        }
    }

    /// Whether `id` names a storage.
    pub fn exists(&self, id: StorageId) -> bool {
        self.storages.contains_key(&id)
    }

    /// All storage ids in ascending order.
    pub fn list(&self) -> Vec<StorageId> {
        let mut ids: Vec<StorageId> = self.storages.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// All storages in ascending id order.
    pub fn all(&self) -> Vec<Arc<Storage>> {
        let mut storages: Vec<Arc<Storage>> =
            self.storages.iter().map(|e| Arc::clone(e.value())).collect();
        storages.sort_unstable_by_key(|s| s.id());
        storages
    }

    /// Number of storages.
    pub fn len(&self) -> usize {
        self.storages.len()
    }

    /// Whether no storage exists.
    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }
}
