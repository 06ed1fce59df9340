//! Access to locally stored items.

use std::collections::BTreeMap;

use kadmesh_types::{Bytes, CompositeKey, Id};

/// The local store as seen by replication.
pub trait StorageAccessor: Send + Sync {
    /// Every item stored under `location`, ordered by key.
    fn read_range(&self, location: &Id) -> BTreeMap<CompositeKey, Bytes>;

    /// Drop every item stored under `location` after responsibility for it
    /// was handed to another peer.
    fn remove_range(&self, location: &Id);
}
