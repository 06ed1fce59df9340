//! Queue of peers awaiting a liveness re-check.

use std::collections::HashMap;

use kadmesh_types::{Id, PeerAddress};
use tokio::time::Instant;

/// At most one scheduled check per peer. Scheduling again replaces the
/// previous entry.
#[derive(Debug, Default)]
pub struct MaintenanceQueue {
    entries: HashMap<Id, (PeerAddress, Instant)>,
}

impl MaintenanceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, peer: PeerAddress, at: Instant) {
        self.entries.insert(peer.id(), (peer, at));
    }

    pub fn remove(&mut self, id: &Id) -> bool {
        self.entries.remove(id).is_some()
    }

    /// When `id` is next due, if it is queued.
    pub fn scheduled_at(&self, id: &Id) -> Option<Instant> {
        self.entries.get(id).map(|(_, at)| *at)
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<PeerAddress> {
        let due_ids: Vec<Id> = self
            .entries
            .iter()
            .filter(|(_, (_, at))| *at <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut due: Vec<(PeerAddress, Instant)> = due_ids
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.id().cmp(&b.0.id())));
        due.into_iter().map(|(peer, _)| peer).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_take_due_in_schedule_order() {
        let mut queue = MaintenanceQueue::new();
        let now = Instant::now();
        queue.schedule(PeerAddress::from_id(Id::from_u64(1)), now + Duration::from_secs(2));
        queue.schedule(PeerAddress::from_id(Id::from_u64(2)), now);
        queue.schedule(PeerAddress::from_id(Id::from_u64(3)), now + Duration::from_secs(30));

        let due = queue.take_due(now + Duration::from_secs(5));
        let ids: Vec<u64> = due.iter().map(|p| p.id().low_u64()).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(queue.len(), 1);
        assert!(queue.take_due(now + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_reschedule_replaces() {
        let mut queue = MaintenanceQueue::new();
        let now = Instant::now();
        let peer = PeerAddress::from_id(Id::from_u64(1));
        queue.schedule(peer.clone(), now);
        queue.schedule(peer, now + Duration::from_secs(10));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.scheduled_at(&Id::from_u64(1)), Some(now + Duration::from_secs(10)));
        assert!(queue.take_due(now).is_empty());
        assert!(queue.remove(&Id::from_u64(1)));
        assert!(queue.is_empty());
    }
}
