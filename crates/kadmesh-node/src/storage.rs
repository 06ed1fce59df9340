//! In-memory item store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use kadmesh_replication::StorageAccessor;
use kadmesh_types::{Bytes, CompositeKey, Id};
use tracing::trace;

/// Items of one node, ordered by composite key.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<CompositeKey, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, BTreeMap<CompositeKey, Bytes>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `value`, returning the value it replaced.
    pub fn put(&self, key: CompositeKey, value: Bytes) -> Option<Bytes> {
        self.items().insert(key, value)
    }

    /// Store `value` unless `key` is already present. Returns whether it was
    /// stored.
    pub fn put_if_absent(&self, key: CompositeKey, value: Bytes) -> bool {
        let mut items = self.items();
        if items.contains_key(&key) {
            return false;
        }
        items.insert(key, value);
        true
    }

    pub fn get(&self, key: &CompositeKey) -> Option<Bytes> {
        self.items().get(key).cloned()
    }

    pub fn contains(&self, key: &CompositeKey) -> bool {
        self.items().contains_key(key)
    }

    /// Distinct location keys with at least one item.
    pub fn locations(&self) -> BTreeSet<Id> {
        self.items().keys().map(|key| key.location).collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

impl StorageAccessor for MemoryStorage {
    fn read_range(&self, location: &Id) -> BTreeMap<CompositeKey, Bytes> {
        let (lo, hi) = CompositeKey::location_range(*location);
        self.items()
            .range(lo..=hi)
            .map(|(key, value)| (*key, value.clone()))
            .collect()
    }

    fn remove_range(&self, location: &Id) {
        let (lo, hi) = CompositeKey::location_range(*location);
        let mut items = self.items();
        let doomed: Vec<CompositeKey> = items.range(lo..=hi).map(|(key, _)| *key).collect();
        for key in &doomed {
            items.remove(key);
        }
        trace!(%location, removed = doomed.len(), "local copy dropped");
    }
}
