//! One overlay peer.
//!
//! A [`Node`] owns its routing table, local store, replication manager and,
//! unless a fixed factor is configured, a churn predictor feeding the
//! replication factor. Replicas travel through the [`ReplicaSender`] given at
//! construction.

use std::collections::BTreeMap;
use std::sync::Arc;

use kadmesh_dht::PeerMap;
use kadmesh_replication::{
    AutoReplication, FixedReplicationFactor, Pending, ReplicaSender, Replication,
    ReplicationExecutor, ReplicationFactor, ResponsibilityListener,
};
use kadmesh_types::{Bytes, CompositeKey, Id, PeerAddress};
use tracing::{debug, info};

use crate::config::{NodeConfig, SchedulerConfig};
use crate::scheduler::Scheduler;
use crate::storage::MemoryStorage;
use crate::Result;

pub struct Node {
    address: PeerAddress,
    peer_map: Arc<PeerMap>,
    storage: Arc<MemoryStorage>,
    replication: Arc<Replication>,
    auto: Option<Arc<AutoReplication>>,
    factor: Arc<dyn ReplicationFactor>,
    executor: Arc<dyn ResponsibilityListener>,
}

impl Node {
    /// Assemble a node. Must be called from within a tokio runtime.
    pub fn new(
        address: PeerAddress,
        config: &NodeConfig,
        sender: Arc<dyn ReplicaSender>,
    ) -> Result<Arc<Self>> {
        let peer_map = Arc::new(PeerMap::new(config.routing.peer_map_config(address.id()))?);
        let storage = Arc::new(MemoryStorage::new());

        let auto = if config.replication.auto_factor {
            Some(Arc::new(AutoReplication::new(
                Arc::clone(&peer_map),
                config.churn.auto_replication_config(),
            )?))
        } else {
            None
        };
        let factor: Arc<dyn ReplicationFactor> = match &auto {
            Some(auto) => auto.clone(),
            None => Arc::new(FixedReplicationFactor::new(config.replication.factor)),
        };

        let replication = Replication::new(
            Arc::clone(&peer_map),
            storage.clone(),
            Arc::clone(&factor),
            config.replication.replication_config(),
        )?;
        let executor: Arc<dyn ResponsibilityListener> = Arc::new(ReplicationExecutor::new(
            Arc::clone(&peer_map),
            storage.clone(),
            sender,
            Arc::clone(&factor),
        ));
        replication.add_responsibility_listener(Arc::clone(&executor));

        Ok(Arc::new(Self {
            address,
            peer_map,
            storage,
            replication,
            auto,
            factor,
            executor,
        }))
    }

    /// Follow routing table changes.
    pub fn start(&self) {
        self.replication.start();
        if let Some(auto) = &self.auto {
            auto.start();
        }
        info!(node = %self.address, "node started");
    }

    /// Stop reacting to routing table changes and stop sending replicas.
    pub fn shutdown(&self) {
        self.replication.shutdown();
        self.replication.remove_responsibility_listener(&self.executor);
        if let Some(auto) = &self.auto {
            auto.shutdown();
        }
        info!(node = %self.address, "node stopped");
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn id(&self) -> Id {
        self.address.id()
    }

    pub fn peer_map(&self) -> &Arc<PeerMap> {
        &self.peer_map
    }

    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    pub fn replication(&self) -> &Arc<Replication> {
        &self.replication
    }

    pub fn auto_replication(&self) -> Option<&Arc<AutoReplication>> {
        self.auto.as_ref()
    }

    /// The replication factor currently in effect.
    pub fn replication_factor(&self) -> usize {
        self.factor.replication_factor()
    }

    /// Store an item locally and let replication place it.
    pub fn put(&self, key: CompositeKey, value: Bytes) -> Pending {
        self.storage.put(key, value);
        self.replication.data_inserted(key.location)
    }

    /// Accept replicas pushed by another peer. Items already present are
    /// left untouched.
    pub fn store_replica(&self, location: Id, data: BTreeMap<CompositeKey, Bytes>) -> Pending {
        let mut stored = 0;
        for (key, value) in data {
            if key.location == location && self.storage.put_if_absent(key, value) {
                stored += 1;
            }
        }
        debug!(node = %self.address, %location, stored, "replica received");
        self.replication.data_inserted(location)
    }

    /// Probe every peer whose re-check is due. Returns how many were probed.
    pub fn run_maintenance(&self, probe: &dyn Fn(&PeerAddress) -> bool) -> usize {
        let due = self.peer_map.peers_for_maintenance();
        for peer in &due {
            if probe(peer) {
                let _ = self.peer_map.peer_found(peer, None);
            } else {
                self.peer_map.peer_offline(peer, false);
            }
        }
        due.len()
    }

    /// Fold departures into the churn predictor. `None` with a fixed factor.
    pub fn tick_churn(&self) -> Option<usize> {
        self.auto.as_ref().map(|auto| auto.tick())
    }

    /// Register the maintenance sweep, the churn predictor tick and the
    /// responsibility refresh on `scheduler`.
    pub fn spawn_services<P>(
        self: &Arc<Self>,
        scheduler: &mut Scheduler,
        config: &SchedulerConfig,
        probe: P,
    ) where
        P: Fn(&PeerAddress) -> bool + Send + Sync + 'static,
    {
        let node = Arc::clone(self);
        scheduler.every("maintenance", config.maintenance_interval(), move || {
            node.run_maintenance(&probe);
            std::future::ready(())
        });

        if self.auto.is_some() {
            let node = Arc::clone(self);
            scheduler.every("churn", config.churn_interval(), move || {
                node.tick_churn();
                std::future::ready(())
            });
        }

        let node = Arc::clone(self);
        scheduler.every("refresh", config.refresh_interval(), move || {
            let refreshed = node.replication.refresh();
            let id = node.id();
            async move {
                if let Err(err) = refreshed.await {
                    debug!(node = %id, error = %err, "refresh incomplete");
                }
            }
        });
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("peers", &self.peer_map.size())
            .field("items", &self.storage.len())
            .field("factor", &self.replication_factor())
            .finish_non_exhaustive()
    }
}
