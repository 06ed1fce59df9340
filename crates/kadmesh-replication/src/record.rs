//! Who is responsible for which location key.

use std::collections::{BTreeSet, HashMap};

use kadmesh_types::Id;

/// Forward map (location to responsible peer) and its reverse index (peer to
/// locations). Both sides are updated together.
#[derive(Debug, Default, Clone)]
pub struct ResponsibilityRecord {
    by_location: HashMap<Id, Id>,
    by_peer: HashMap<Id, BTreeSet<Id>>,
}

impl ResponsibilityRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer` as responsible for `location`. Returns true if this
    /// changed the record.
    pub fn update(&mut self, location: Id, peer: Id) -> bool {
        match self.by_location.insert(location, peer) {
            Some(previous) if previous == peer => false,
            Some(previous) => {
                self.unlink(&previous, &location);
                self.by_peer.entry(peer).or_default().insert(location);
                true
            }
            None => {
                self.by_peer.entry(peer).or_default().insert(location);
                true
            }
        }
    }

    /// Forget `location`, returning who was responsible for it.
    pub fn remove(&mut self, location: &Id) -> Option<Id> {
        let peer = self.by_location.remove(location)?;
        self.unlink(&peer, location);
        Some(peer)
    }

    fn unlink(&mut self, peer: &Id, location: &Id) {
        if let Some(locations) = self.by_peer.get_mut(peer) {
            locations.remove(location);
            if locations.is_empty() {
                self.by_peer.remove(peer);
            }
        }
    }

    pub fn responsible(&self, location: &Id) -> Option<Id> {
        self.by_location.get(location).copied()
    }

    /// Locations `peer` is recorded as responsible for, in key order.
    pub fn locations_of(&self, peer: &Id) -> Vec<Id> {
        self.by_peer
            .get(peer)
            .map(|locations| locations.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_location.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty()
    }

    /// Whether both indexes describe the same relation.
    pub fn is_consistent(&self) -> bool {
        let reverse_total: usize = self.by_peer.values().map(BTreeSet::len).sum();
        reverse_total == self.by_location.len()
            && self.by_location.iter().all(|(location, peer)| {
                self.by_peer
                    .get(peer)
                    .is_some_and(|locations| locations.contains(location))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_reports_changes() {
        let mut record = ResponsibilityRecord::new();
        let location = Id::from_u64(10);
        assert!(record.update(location, Id::from_u64(1)));
        assert!(!record.update(location, Id::from_u64(1)));
        assert!(record.update(location, Id::from_u64(2)));
        assert_eq!(record.responsible(&location), Some(Id::from_u64(2)));
        assert!(record.locations_of(&Id::from_u64(1)).is_empty());
        assert_eq!(record.locations_of(&Id::from_u64(2)), vec![location]);
        assert!(record.is_consistent());
    }

    #[test]
    fn test_remove_clears_both_sides() {
        let mut record = ResponsibilityRecord::new();
        let peer = Id::from_u64(1);
        for location in 10..15u64 {
            record.update(Id::from_u64(location), peer);
        }
        assert_eq!(record.remove(&Id::from_u64(12)), Some(peer));
        assert_eq!(record.remove(&Id::from_u64(12)), None);
        assert_eq!(record.len(), 4);
        assert_eq!(record.locations_of(&peer).len(), 4);
        assert!(record.is_consistent());

        for location in [10u64, 11, 13, 14] {
            record.remove(&Id::from_u64(location));
        }
        assert!(record.is_empty());
        assert!(record.locations_of(&peer).is_empty());
        assert!(record.is_consistent());
    }
}
