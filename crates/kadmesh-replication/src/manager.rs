//! Replica responsibility decisions.
//!
//! Two models are supported:
//!
//! - **0-root**: the single peer closest to a location key (the local peer
//!   included) is responsible for it.
//! - **n-root**: the `factor` closest peers are all responsible. A peer is in
//!   replication range iff fewer than `factor` peers, the local one included,
//!   are strictly closer to the key.
//!
//! [`Replication`] re-evaluates responsibility when data is inserted locally
//! and when the routing table gains or loses a peer. Decisions are pushed to
//! [`ResponsibilityListener`]s. A hand-off to another peer only gives up local
//! responsibility once every listener reported success; on failure the local
//! peer stays responsible and the next trigger tries again. Only the latest
//! hand-off issued for a location may settle it; outcomes of superseded ones
//! are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use kadmesh_dht::{PeerMap, PeerMapChangeListener, RemovalReason};
use kadmesh_types::{Id, PeerAddress};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::factor::ReplicationFactor;
use crate::listener::ResponsibilityListener;
use crate::pending::Pending;
use crate::record::ResponsibilityRecord;
use crate::storage::StorageAccessor;
use crate::{ReplicationError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Replication mode switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Use the n-root model instead of 0-root.
    pub n_root: bool,
    /// Keep local data after responsibility moved to another peer.
    pub keep_data: bool,
}

/// The latest hand-off generation issued per location.
#[derive(Debug, Default)]
struct HandOffLedger {
    next: u64,
    latest: HashMap<Id, u64>,
}

impl HandOffLedger {
    fn issue(&mut self, location: Id) -> u64 {
        self.next += 1;
        self.latest.insert(location, self.next);
        self.next
    }

    /// Whether `generation` is still the latest hand-off for `location`.
    /// Consumes the entry if so.
    fn settle(&mut self, location: &Id, generation: u64) -> bool {
        if self.latest.get(location) == Some(&generation) {
            self.latest.remove(location);
            true
        } else {
            false
        }
    }

    fn supersede(&mut self, location: &Id) {
        self.latest.remove(location);
    }
}

/// Forwards routing table membership changes to a [`Replication`] without
/// keeping it alive.
struct MembershipHook(Weak<Replication>);

impl PeerMapChangeListener for MembershipHook {
    fn on_inserted(&self, peer: &PeerAddress, verified: bool) {
        if let Some(replication) = self.0.upgrade() {
            let _ = replication.peer_inserted(peer, verified);
        }
    }

    fn on_removed(&self, peer: &PeerAddress, _reason: RemovalReason) {
        if let Some(replication) = self.0.upgrade() {
            let _ = replication.peer_removed(peer);
        }
    }
}

/// The replication manager.
pub struct Replication {
    peer_map: Arc<PeerMap>,
    self_id: Id,
    factor: Arc<dyn ReplicationFactor>,
    n_root: AtomicBool,
    keep_data: AtomicBool,
    record: Arc<Mutex<ResponsibilityRecord>>,
    // Locked before `record` when both are held.
    hand_offs: Arc<Mutex<HandOffLedger>>,
    storage: Arc<dyn StorageAccessor>,
    listeners: RwLock<Vec<Arc<dyn ResponsibilityListener>>>,
    hook: Mutex<Option<Arc<dyn PeerMapChangeListener>>>,
    runtime: Handle,
}

impl Replication {
    /// Create a manager for the table's local peer.
    ///
    /// Must be called from within a tokio runtime; hand-off completions run
    /// on it.
    pub fn new(
        peer_map: Arc<PeerMap>,
        storage: Arc<dyn StorageAccessor>,
        factor: Arc<dyn ReplicationFactor>,
        config: ReplicationConfig,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| ReplicationError::NoRuntime)?;
        Ok(Arc::new(Self {
            self_id: peer_map.self_id(),
            peer_map,
            factor,
            n_root: AtomicBool::new(config.n_root),
            keep_data: AtomicBool::new(config.keep_data),
            record: Arc::new(Mutex::new(ResponsibilityRecord::new())),
            hand_offs: Arc::new(Mutex::new(HandOffLedger::default())),
            storage,
            listeners: RwLock::new(Vec::new()),
            hook: Mutex::new(None),
            runtime,
        }))
    }

    /// Subscribe to routing table membership changes.
    pub fn start(self: &Arc<Self>) {
        let mut hook = lock(&self.hook);
        if hook.is_some() {
            return;
        }
        let listener: Arc<dyn PeerMapChangeListener> =
            Arc::new(MembershipHook(Arc::downgrade(self)));
        self.peer_map.add_change_listener(Arc::clone(&listener));
        *hook = Some(listener);
    }

    /// Stop following the routing table.
    pub fn shutdown(&self) {
        if let Some(listener) = lock(&self.hook).take() {
            self.peer_map.remove_change_listener(&listener);
        }
    }

    pub fn self_id(&self) -> Id {
        self.self_id
    }

    pub fn peer_map(&self) -> &Arc<PeerMap> {
        &self.peer_map
    }

    pub fn is_n_root(&self) -> bool {
        self.n_root.load(Ordering::Acquire)
    }

    pub fn set_n_root(&self, n_root: bool) {
        self.n_root.store(n_root, Ordering::Release);
    }

    pub fn is_keep_data(&self) -> bool {
        self.keep_data.load(Ordering::Acquire)
    }

    pub fn set_keep_data(&self, keep_data: bool) {
        self.keep_data.store(keep_data, Ordering::Release);
    }

    /// The factor currently in effect, never below one.
    pub fn replication_factor(&self) -> usize {
        self.factor.replication_factor().max(1)
    }

    pub fn add_responsibility_listener(&self, listener: Arc<dyn ResponsibilityListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn remove_responsibility_listener(
        &self,
        listener: &Arc<dyn ResponsibilityListener>,
    ) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    fn responsibility_listeners(&self) -> Vec<Arc<dyn ResponsibilityListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replication runs only while someone listens for its decisions.
    pub fn is_enabled(&self) -> bool {
        !self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }

    /// Who is recorded as responsible for `location`.
    pub fn responsible_for(&self, location: &Id) -> Option<Id> {
        lock(&self.record).responsible(location)
    }

    /// Locations the local peer is responsible for.
    pub fn responsible_locations(&self) -> Vec<Id> {
        lock(&self.record).locations_of(&self.self_id)
    }

    /// A copy of the responsibility record.
    pub fn record_snapshot(&self) -> ResponsibilityRecord {
        lock(&self.record).clone()
    }

    /// The closest peer to `location`, the local peer included.
    pub fn closest(&self, location: &Id) -> PeerAddress {
        let self_distance = location.xor(&self.self_id);
        match self.peer_map.close_peers(location, 1).into_iter().next() {
            Some(peer) if location.xor(&peer.id()) < self_distance => peer,
            _ => self.self_address(),
        }
    }

    fn self_address(&self) -> PeerAddress {
        PeerAddress::from_id(self.self_id)
    }

    fn is_self(&self, peer: &PeerAddress) -> bool {
        peer.id() == self.self_id
    }

    /// Whether `candidate` is among the `factor` peers closest to
    /// `location`, the local peer included.
    pub fn is_in_replication_range(&self, location: &Id, candidate: &Id, factor: usize) -> bool {
        let candidate_distance = location.xor(candidate);
        let closer_peers = self
            .peer_map
            .close_peers(location, factor)
            .iter()
            .filter(|peer| location.xor(&peer.id()) < candidate_distance)
            .count();
        let self_closer = usize::from(location.xor(&self.self_id) < candidate_distance);
        closer_peers + self_closer < factor
    }

    /// Data for `location` was stored locally.
    pub fn data_inserted(&self, location: Id) -> Pending {
        if !self.is_enabled() {
            return Pending::ok();
        }
        let factor = self.replication_factor();
        if self.is_n_root() {
            if self.is_in_replication_range(&location, &self.self_id, factor) {
                if self.claim(location) {
                    debug!(%location, "responsible for new location");
                    return self.notify_me_responsible(location);
                }
                return Pending::ok();
            }
            let closest = self.closest(&location);
            debug!(%location, closest = %closest, factor, "not in replication range");
            return self.hand_off(location, closest, true);
        }

        let closest = self.closest(&location);
        if self.is_self(&closest) {
            if self.claim(location) {
                debug!(%location, "responsible for new location");
                return self.notify_me_responsible(location);
            }
            return Pending::ok();
        }
        if self.responsible_for(&location) == Some(closest.id()) {
            trace!(%location, responsible = %closest, "responsibility already known");
            return Pending::ok();
        }
        self.hand_off(location, closest, false)
    }

    /// Data for `location` was deleted locally.
    pub fn data_removed(&self, location: &Id) {
        if !self.is_enabled() {
            return;
        }
        let mut hand_offs = lock(&self.hand_offs);
        hand_offs.supersede(location);
        if lock(&self.record).remove(location).is_some() {
            debug!(%location, "responsibility dropped with data");
        }
    }

    /// The routing table gained a peer. Only verified peers can take over
    /// or join a replica set.
    pub fn peer_inserted(&self, peer: &PeerAddress, verified: bool) -> Pending {
        if !self.is_enabled() || !verified {
            return Pending::ok();
        }
        let locations = self.responsible_locations();
        if locations.is_empty() {
            return Pending::ok();
        }
        debug!(peer = %peer, locations = locations.len(), "re-checking responsibilities after join");
        let factor = self.replication_factor();
        let n_root = self.is_n_root();

        let mut pendings = Vec::new();
        for location in locations {
            if n_root {
                if self.is_in_replication_range(&location, &peer.id(), factor) {
                    if self.is_in_replication_range(&location, &self.self_id, factor) {
                        pendings.push(self.notify_me_responsible_for(location, peer));
                    } else {
                        pendings.push(self.hand_off(location, peer.clone(), true));
                    }
                } else if !self.is_in_replication_range(&location, &self.self_id, factor) {
                    let closest = self.closest(&location);
                    pendings.push(self.hand_off(location, closest, true));
                }
                continue;
            }

            let closest = self.closest(&location);
            if !self.is_self(&closest) {
                // Still a replica holder if in range; otherwise give it up.
                let release = !self.is_in_replication_range(&location, &self.self_id, factor);
                pendings.push(self.hand_off(location, closest, release));
            } else if self.is_in_replication_range(&location, &peer.id(), factor) {
                pendings.push(self.notify_me_responsible_for(location, peer));
            }
        }
        Pending::all(pendings)
    }

    /// The routing table lost a peer.
    pub fn peer_removed(&self, peer: &PeerAddress) -> Pending {
        if !self.is_enabled() {
            return Pending::ok();
        }
        let (mut my_locations, their_locations) = {
            let record = lock(&self.record);
            (
                record.locations_of(&self.self_id),
                record.locations_of(&peer.id()),
            )
        };
        debug!(
            peer = %peer,
            mine = my_locations.len(),
            theirs = their_locations.len(),
            "re-checking responsibilities after departure"
        );
        let factor = self.replication_factor();
        let mut pendings = Vec::new();

        if !self.is_n_root() {
            for location in their_locations {
                let closest = self.closest(&location);
                if self.is_self(&closest) {
                    if self.claim(location) {
                        debug!(%location, departed = %peer, "inherited responsibility");
                        pendings.push(self.notify_me_responsible(location));
                    }
                } else {
                    pendings.push(self.hand_off(location, closest, false));
                }
                my_locations.retain(|mine| *mine != location);
            }
        }

        for location in my_locations {
            if self.is_in_replication_range(&location, &peer.id(), factor) {
                debug!(%location, departed = %peer, "replica set lost a member");
                pendings.push(self.notify_me_responsible(location));
            }
        }
        Pending::all(pendings)
    }

    /// Re-announce every location the local peer is responsible for, so the
    /// replica sets are topped up.
    pub fn refresh(&self) -> Pending {
        if !self.is_enabled() {
            return Pending::ok();
        }
        let locations = self.responsible_locations();
        trace!(locations = locations.len(), "refreshing responsibilities");
        Pending::all(
            locations
                .into_iter()
                .map(|location| self.notify_me_responsible(location))
                .collect(),
        )
    }

    /// Record the local peer as responsible, overriding any hand-off still
    /// in flight for `location`.
    fn claim(&self, location: Id) -> bool {
        let mut hand_offs = lock(&self.hand_offs);
        hand_offs.supersede(&location);
        lock(&self.record).update(location, self.self_id)
    }

    fn notify_me_responsible(&self, location: Id) -> Pending {
        Pending::all(
            self.responsibility_listeners()
                .iter()
                .map(|listener| listener.on_me_responsible(location))
                .collect(),
        )
    }

    fn notify_me_responsible_for(&self, location: Id, peer: &PeerAddress) -> Pending {
        debug!(%location, peer = %peer, "peer joined replica set");
        Pending::all(
            self.responsibility_listeners()
                .iter()
                .map(|listener| listener.on_me_responsible_for(location, peer))
                .collect(),
        )
    }

    /// Tell the listeners `target` is responsible for `location`.
    ///
    /// Once all of them succeeded `target` is recorded as responsible. With
    /// `release` set the local peer also leaves the replica set: the record
    /// entry and the local copy are dropped unless data is kept. On failure
    /// the local peer stays responsible. The outcome is only applied if no
    /// newer hand-off or local claim for `location` happened meanwhile.
    fn hand_off(&self, location: Id, target: PeerAddress, release: bool) -> Pending {
        let generation = lock(&self.hand_offs).issue(location);
        debug!(%location, target = %target, release, generation, "handing off responsibility");
        let notified = Pending::all(
            self.responsibility_listeners()
                .iter()
                .map(|listener| listener.on_other_responsible(location, &target))
                .collect(),
        );
        let keep_data = self.is_keep_data();
        let hand_offs = Arc::clone(&self.hand_offs);
        let record = Arc::clone(&self.record);
        let storage = Arc::clone(&self.storage);
        let self_id = self.self_id;

        Pending::spawn(&self.runtime, async move {
            let outcome = notified.await;
            let mut ledger = lock(&hand_offs);
            if !ledger.settle(&location, generation) {
                debug!(
                    %location,
                    target = %target,
                    generation,
                    succeeded = outcome.is_ok(),
                    "superseded hand-off outcome dropped"
                );
                return outcome;
            }
            match outcome {
                Ok(()) => {
                    if release && !keep_data {
                        lock(&record).remove(&location);
                        storage.remove_range(&location);
                    } else {
                        lock(&record).update(location, target.id());
                    }
                    drop(ledger);
                    debug!(%location, target = %target, release, keep_data, "hand-off complete");
                    Ok(())
                }
                Err(err) => {
                    lock(&record).update(location, self_id);
                    drop(ledger);
                    warn!(
                        %location,
                        target = %target,
                        error = %err,
                        "hand-off failed, keeping responsibility"
                    );
                    Err(err)
                }
            }
        })
    }
}

impl std::fmt::Debug for Replication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replication")
            .field("self_id", &self.self_id)
            .field("n_root", &self.is_n_root())
            .field("keep_data", &self.is_keep_data())
            .field("responsible", &lock(&self.record).len())
            .finish_non_exhaustive()
    }
}
