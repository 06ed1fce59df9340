//! The default responsibility listener: moves data with a [`ReplicaSender`].

use std::collections::BTreeMap;
use std::sync::Arc;

use kadmesh_dht::PeerMap;
use kadmesh_types::{Bytes, CompositeKey, Id, PeerAddress};
use tracing::{debug, trace};

use crate::factor::ReplicationFactor;
use crate::listener::ResponsibilityListener;
use crate::pending::Pending;
use crate::sender::ReplicaSender;
use crate::storage::StorageAccessor;

/// Reads the local copy of a location and pushes it to the peers that
/// should hold it.
pub struct ReplicationExecutor {
    peer_map: Arc<PeerMap>,
    storage: Arc<dyn StorageAccessor>,
    sender: Arc<dyn ReplicaSender>,
    factor: Arc<dyn ReplicationFactor>,
}

impl ReplicationExecutor {
    pub fn new(
        peer_map: Arc<PeerMap>,
        storage: Arc<dyn StorageAccessor>,
        sender: Arc<dyn ReplicaSender>,
        factor: Arc<dyn ReplicationFactor>,
    ) -> Self {
        Self {
            peer_map,
            storage,
            sender,
            factor,
        }
    }

    /// The peers that hold the other `factor - 1` replicas of `location`.
    pub fn replica_targets(&self, location: &Id) -> Vec<PeerAddress> {
        let wanted = self.factor.replication_factor().saturating_sub(1);
        self.peer_map
            .close_peers(location, wanted)
            .into_iter()
            .take(wanted)
            .collect()
    }

    fn send_to(&self, location: Id, targets: &[PeerAddress]) -> Pending {
        let data: BTreeMap<CompositeKey, Bytes> = self.storage.read_range(&location);
        if data.is_empty() || targets.is_empty() {
            trace!(%location, items = data.len(), targets = targets.len(), "nothing to send");
            return Pending::ok();
        }
        debug!(%location, items = data.len(), targets = targets.len(), "sending replicas");
        Pending::all(
            targets
                .iter()
                .map(|target| self.sender.send_replica(target, location, data.clone()))
                .collect(),
        )
    }
}

impl ResponsibilityListener for ReplicationExecutor {
    fn on_me_responsible(&self, location: Id) -> Pending {
        let targets = self.replica_targets(&location);
        self.send_to(location, &targets)
    }

    fn on_me_responsible_for(&self, location: Id, peer: &PeerAddress) -> Pending {
        self.send_to(location, std::slice::from_ref(peer))
    }

    fn on_other_responsible(&self, location: Id, target: &PeerAddress) -> Pending {
        self.send_to(location, std::slice::from_ref(target))
    }
}
