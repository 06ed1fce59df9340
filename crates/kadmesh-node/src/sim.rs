//! In-process overlay.
//!
//! [`LoopbackNetwork`] connects [`Node`]s living in one process: replicas are
//! delivered straight into the target node's store on a spawned task, and a
//! peer counts as reachable while it is attached. [`Simulation`] builds an
//! overlay on top of it, stores items and applies random churn.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use kadmesh_replication::{Pending, ReplicaSender, ReplicationError};
use kadmesh_types::{Bytes, CompositeKey, Id, PeerAddress};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, trace};

use crate::config::NodeConfig;
use crate::node::Node;
use crate::scheduler::Scheduler;
use crate::{NodeError, Result};

/// Settle rounds before giving up on in-flight replicas.
const MAX_SETTLE_ROUNDS: usize = 200;

/// Registry of attached nodes.
pub struct LoopbackNetwork {
    nodes: RwLock<HashMap<Id, Arc<Node>>>,
    runtime: Handle,
    sent: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl LoopbackNetwork {
    pub fn new() -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| NodeError::NoRuntime)?;
        Ok(Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            runtime,
            sent: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }))
    }

    /// A replica sender delivering through this network.
    pub fn sender(self: &Arc<Self>) -> Arc<dyn ReplicaSender> {
        Arc::new(LoopbackSender {
            network: Arc::downgrade(self),
            runtime: self.runtime.clone(),
        })
    }

    /// A liveness probe answering from this network's registry.
    pub fn probe(self: &Arc<Self>) -> impl Fn(&PeerAddress) -> bool + Send + Sync + 'static {
        let network = Arc::downgrade(self);
        move |peer: &PeerAddress| {
            network
                .upgrade()
                .is_some_and(|network| network.is_online(&peer.id()))
        }
    }

    /// Attach `node` and introduce it to every attached node, first hand in
    /// both directions.
    pub fn attach(&self, node: Arc<Node>) {
        let others = self.nodes();
        self.nodes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(node.id(), Arc::clone(&node));
        for other in &others {
            let _ = node.peer_map().peer_found(other.address(), None);
            let _ = other.peer_map().peer_found(node.address(), None);
        }
        debug!(node = %node.address(), known = others.len(), "node attached");
    }

    /// Detach and stop a node. Its peers notice through maintenance.
    pub fn detach(&self, id: &Id) -> Option<Arc<Node>> {
        let node = self
            .nodes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)?;
        node.shutdown();
        debug!(node = %node.address(), "node detached");
        Some(node)
    }

    pub fn node(&self, id: &Id) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    pub fn is_online(&self, id: &Id) -> bool {
        self.nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(id)
    }

    /// Attached nodes, ordered by identifier.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self
            .nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        nodes.sort_by_key(|node| node.id());
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replica transfers started but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.sent
            .load(Ordering::SeqCst)
            .saturating_sub(self.completed.load(Ordering::SeqCst))
    }

    /// Transfers that found no attached target.
    pub fn failed_transfers(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Transfers started so far.
    pub fn transfers(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Yield until no replica transfer is in flight, including the
    /// replication work each delivery triggers.
    pub async fn settle(&self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
            if self.in_flight() == 0 {
                // Let hand-off completions observe their last transfer.
                for _ in 0..16 {
                    tokio::task::yield_now().await;
                }
                if self.in_flight() == 0 {
                    return;
                }
            }
        }
        debug!(in_flight = self.in_flight(), "settle gave up");
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("nodes", &self.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

struct LoopbackSender {
    network: Weak<LoopbackNetwork>,
    runtime: Handle,
}

impl ReplicaSender for LoopbackSender {
    fn send_replica(
        &self,
        target: &PeerAddress,
        location: Id,
        data: BTreeMap<CompositeKey, Bytes>,
    ) -> Pending {
        let Some(network) = self.network.upgrade() else {
            return Pending::failed(ReplicationError::Send("network closed".to_string()));
        };
        network.sent.fetch_add(1, Ordering::SeqCst);
        let target = target.clone();
        Pending::spawn(&self.runtime, async move {
            let result = match network.node(&target.id()) {
                Some(node) => {
                    trace!(target = %target, %location, items = data.len(), "replica delivered");
                    // Follow-up replication at the target runs on its own.
                    let _ = node.store_replica(location, data);
                    Ok(())
                }
                None => {
                    network.failed.fetch_add(1, Ordering::SeqCst);
                    Err(ReplicationError::Send(format!("{target} unreachable")))
                }
            };
            network.completed.fetch_add(1, Ordering::SeqCst);
            result
        })
    }
}

/// State of the overlay after one churn tick.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TickReport {
    pub tick: usize,
    pub peers: usize,
    pub stored: usize,
    /// Stored items that still have at least one live copy.
    pub surviving: usize,
    /// Mean number of live copies per surviving item.
    pub mean_copies: f64,
    /// Replication factor of every node, averaged.
    pub mean_factor: f64,
    pub max_factor: usize,
}

/// A churning overlay of loopback nodes.
pub struct Simulation {
    config: NodeConfig,
    network: Arc<LoopbackNetwork>,
    /// Background services per node, only when enabled.
    services: Option<HashMap<Id, Scheduler>>,
    rng: StdRng,
    next_port: u16,
    stored: Vec<CompositeKey>,
}

impl Simulation {
    /// An overlay driven by explicit calls only.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let rng = match config.simulation.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            network: LoopbackNetwork::new()?,
            config,
            services: None,
            rng,
            next_port: 7000,
            stored: Vec::new(),
        })
    }

    /// An overlay whose nodes also run their scheduled services.
    pub fn with_services(config: NodeConfig) -> Result<Self> {
        let mut simulation = Self::new(config)?;
        simulation.services = Some(HashMap::new());
        Ok(simulation)
    }

    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Items stored through [`Simulation::store_random`].
    pub fn stored(&self) -> &[CompositeKey] {
        &self.stored
    }

    /// Create, start and attach a node with a random identifier.
    pub fn spawn_node(&mut self) -> Result<Arc<Node>> {
        let id = Id::random(&mut self.rng);
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(1024);
        let address = PeerAddress::from_socket(id, SocketAddr::from((Ipv4Addr::LOCALHOST, port)));

        let node = Node::new(address, &self.config, self.network.sender())?;
        node.start();
        if let Some(services) = &mut self.services {
            let mut scheduler = Scheduler::new()?;
            node.spawn_services(&mut scheduler, &self.config.scheduler, self.network.probe());
            services.insert(id, scheduler);
        }
        self.network.attach(Arc::clone(&node));
        Ok(node)
    }

    /// Spawn `count` nodes.
    pub fn populate(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.spawn_node()?;
        }
        info!(peers = self.network.len(), "overlay populated");
        Ok(())
    }

    /// Store `count` random items, each at a random node. Returns how many
    /// were stored.
    pub fn store_random(&mut self, count: usize) -> usize {
        let nodes = self.network.nodes();
        if nodes.is_empty() {
            return 0;
        }
        for index in 0..count {
            let Some(node) = nodes.choose(&mut self.rng) else {
                break;
            };
            let key = CompositeKey::new(
                Id::random(&mut self.rng),
                Id::ZERO,
                Id::random(&mut self.rng),
            );
            let _ = node.put(key, (index as u64).to_be_bytes().to_vec());
            self.stored.push(key);
        }
        count
    }

    /// Detach `count` random nodes. Returns their identifiers.
    pub fn depart_random(&mut self, count: usize) -> Vec<Id> {
        let mut ids: Vec<Id> = self.network.nodes().iter().map(|node| node.id()).collect();
        ids.shuffle(&mut self.rng);
        ids.truncate(count);
        for id in &ids {
            self.depart(id);
        }
        ids
    }

    /// Detach one node and stop its services.
    pub fn depart(&mut self, id: &Id) -> bool {
        if let Some(services) = &mut self.services {
            services.remove(id);
        }
        self.network.detach(id).is_some()
    }

    /// One round of churn: `count` departures followed by `count` arrivals.
    pub fn churn(&mut self, count: usize) -> Result<Vec<Id>> {
        let departed = self.depart_random(count);
        for _ in 0..count {
            self.spawn_node()?;
        }
        Ok(departed)
    }

    /// Run every node's due maintenance checks. Returns how many peers were
    /// probed.
    pub fn run_maintenance(&self) -> usize {
        let probe = self.network.probe();
        self.network
            .nodes()
            .iter()
            .map(|node| node.run_maintenance(&probe))
            .sum()
    }

    /// Tick every node's churn predictor.
    pub fn tick_predictors(&self) {
        for node in self.network.nodes() {
            node.tick_churn();
        }
    }

    /// Re-publish every node's responsible locations.
    pub fn refresh(&self) {
        for node in self.network.nodes() {
            let _ = node.replication().refresh();
        }
    }

    /// Yield until no replica transfer is in flight.
    pub async fn settle(&self) {
        self.network.settle().await;
    }

    /// Live copies of `key` across attached nodes.
    pub fn copies_of(&self, key: &CompositeKey) -> usize {
        self.network
            .nodes()
            .iter()
            .filter(|node| node.storage().contains(key))
            .count()
    }

    /// Snapshot of the overlay.
    pub fn report(&self, tick: usize) -> TickReport {
        let nodes = self.network.nodes();
        let copies: Vec<usize> = self
            .stored
            .iter()
            .map(|key| nodes.iter().filter(|node| node.storage().contains(key)).count())
            .filter(|copies| *copies > 0)
            .collect();
        let factors: Vec<usize> = nodes.iter().map(|node| node.replication_factor()).collect();
        TickReport {
            tick,
            peers: nodes.len(),
            stored: self.stored.len(),
            surviving: copies.len(),
            mean_copies: mean(&copies),
            mean_factor: mean(&factors),
            max_factor: factors.iter().copied().max().unwrap_or(0),
        }
    }

    /// Stop every node and its services.
    pub async fn shutdown(mut self) {
        if let Some(services) = self.services.take() {
            for (_, scheduler) in services {
                scheduler.shutdown().await;
            }
        }
        for node in self.network.nodes() {
            self.network.detach(&node.id());
        }
    }

    /// Tick length configured for the run.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.config.simulation.tick_interval_ms)
    }
}

fn mean(values: &[usize]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<usize>() as f64 / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.simulation.seed = Some(42);
        config.routing.bag_size = 8;
        config.replication.auto_factor = false;
        config.replication.factor = 3;
        config
    }

    #[test]
    fn test_network_requires_runtime() {
        assert!(matches!(LoopbackNetwork::new(), Err(NodeError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_attach_introduces_first_hand() {
        let mut simulation = Simulation::new(config()).expect("simulation");
        simulation.populate(4).expect("populated");
        for node in simulation.network().nodes() {
            assert_eq!(node.peer_map().size(), 3);
        }
    }

    #[tokio::test]
    async fn test_send_to_detached_node_fails() {
        let mut simulation = Simulation::new(config()).expect("simulation");
        let a = simulation.spawn_node().expect("node");
        let b = simulation.spawn_node().expect("node");
        assert!(simulation.depart(&b.id()));

        let sender = simulation.network().sender();
        let result = sender
            .send_replica(b.address(), Id::from_u64(1), BTreeMap::new())
            .await;
        assert!(matches!(result, Err(ReplicationError::Send(_))));
        assert_eq!(simulation.network().failed_transfers(), 1);

        let result = sender
            .send_replica(a.address(), Id::from_u64(1), BTreeMap::new())
            .await;
        assert_eq!(result, Ok(()));
        assert_eq!(simulation.network().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stored_items_reach_factor_copies() {
        let mut simulation = Simulation::new(config()).expect("simulation");
        simulation.populate(8).expect("populated");
        simulation.settle().await;
        assert_eq!(simulation.store_random(10), 10);
        simulation.settle().await;

        let report = simulation.report(0);
        assert_eq!(report.surviving, 10);
        for key in simulation.stored() {
            assert!(simulation.copies_of(key) >= 3, "{key} under-replicated");
        }
        assert_eq!(report.max_factor, 3);
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[1, 2, 3, 6]), 3.0);
    }
}
