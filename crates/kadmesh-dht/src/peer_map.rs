//! Distance-class routing table.
//!
//! Peers are kept in 160 buckets indexed by `bit_length(self XOR id) - 1`.
//! Bucket 0 holds the single closest possible peer, bucket 159 covers half
//! of the identifier space.
//!
//! ## Eviction
//!
//! A bucket may grow past `bag_size` while the table has room. Once the peer
//! cap is reached, a new peer only gets in by displacing someone from the
//! farthest over-full bucket, and only if that bucket is farther than the
//! new peer's own. The displaced peer is the one least recently confirmed
//! online. Under pressure the table therefore keeps close peers, which is
//! what iterative lookups depend on.
//!
//! ## Locking
//!
//! Every bucket has its own mutex. The peer count is an atomic that is
//! reserved while the target bucket lock is held. The offline log, the
//! maintenance queue and the listener registry each have their own lock and
//! no code path holds two of them at once. Listeners run with no lock held.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use kadmesh_types::{Id, PeerAddress};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::PeerMapConfig;
use crate::listener::{PeerMapChangeListener, PeerStatusListener, RemovalReason};
use crate::maintenance::MaintenanceQueue;
use crate::offline::{FailureVerdict, OfflineLog};
use crate::statistic::PeerStatistic;
use crate::{DhtError, Result, NUM_CLASSES};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A peer held by the table.
#[derive(Debug)]
struct PeerEntry {
    address: PeerAddress,
    statistic: Arc<PeerStatistic>,
}

/// One distance class.
#[derive(Debug, Default)]
struct Bucket {
    peers: HashMap<Id, PeerEntry>,
}

impl Bucket {
    /// The occupant least recently confirmed online. Peers never seen
    /// first-hand come first.
    fn least_recently_online(&self) -> Option<&PeerEntry> {
        self.peers.values().min_by(|a, b| {
            a.statistic
                .last_seen_online()
                .cmp(&b.statistic.last_seen_online())
                .then_with(|| a.address.id().cmp(&b.address.id()))
        })
    }
}

#[derive(Default)]
struct Listeners {
    change: Vec<Arc<dyn PeerMapChangeListener>>,
    status: Vec<Arc<dyn PeerStatusListener>>,
}

/// Why [`PeerMap::peer_found`] refused a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    ZeroId,
    SelfId,
    /// The peer is banned by the offline log.
    Offline,
    /// The peer's IP is on the address filter.
    AddressFiltered,
    /// An injected [`crate::PeerFilter`] refused the peer.
    PolicyFiltered,
    /// The peer announced a firewalled TCP port.
    Firewalled,
    /// Second-hand gossip about an unknown peer in first-hand-only mode.
    NotFirstHand,
    /// The table is full and no farther over-full class could give up a slot.
    Full,
}

/// Result of offering a peer to the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FoundOutcome {
    /// The peer was newly added.
    Inserted,
    /// The peer was already known; its address and statistics were refreshed.
    Updated,
    /// The peer was refused.
    Rejected(Rejection),
}

impl FoundOutcome {
    /// Whether the peer is in the table after the call.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, FoundOutcome::Rejected(_))
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, FoundOutcome::Inserted)
    }
}

enum Slot {
    Inserted(Arc<PeerStatistic>),
    Updated(Arc<PeerStatistic>),
}

/// The routing table.
pub struct PeerMap {
    self_id: Id,
    config: PeerMapConfig,
    max_peers: usize,
    buckets: Vec<Mutex<Bucket>>,
    peer_count: AtomicUsize,
    offline: Mutex<OfflineLog>,
    maintenance: Mutex<MaintenanceQueue>,
    filtered_addresses: RwLock<HashSet<IpAddr>>,
    listeners: RwLock<Listeners>,
}

impl PeerMap {
    /// Build an empty table from a validated configuration.
    pub fn new(config: PeerMapConfig) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.offline_cache_size).ok_or_else(|| {
            DhtError::InvalidConfig("offline cache must hold at least one entry".to_string())
        })?;
        let buckets = (0..NUM_CLASSES).map(|_| Mutex::default()).collect();
        Ok(Self {
            self_id: config.self_id,
            max_peers: config.max_peers(),
            buckets,
            peer_count: AtomicUsize::new(0),
            offline: Mutex::new(OfflineLog::new(
                capacity,
                config.offline_timeout,
                config.offline_count,
            )),
            maintenance: Mutex::new(MaintenanceQueue::new()),
            filtered_addresses: RwLock::new(HashSet::new()),
            listeners: RwLock::new(Listeners::default()),
            config,
        })
    }

    pub fn self_id(&self) -> Id {
        self.self_id
    }

    pub fn config(&self) -> &PeerMapConfig {
        &self.config
    }

    /// Peer cap of the table.
    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Number of peers currently in the table.
    pub fn size(&self) -> usize {
        self.peer_count.load(atomic::Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// XOR distance between two identifiers.
    pub fn distance(a: &Id, b: &Id) -> Id {
        a.xor(b)
    }

    /// Compare `a` and `b` by distance to `key`. `Less` means `a` is closer.
    pub fn is_closer(key: &Id, a: &Id, b: &Id) -> Ordering {
        key.xor(a).cmp(&key.xor(b))
    }

    /// The bucket `id` belongs to, or `None` for the local identifier.
    pub fn class_of(&self, id: &Id) -> Option<usize> {
        self.self_id.class_of(id)
    }

    /// Offer a peer to the table.
    ///
    /// `referrer` is `None` when the peer was contacted directly; otherwise
    /// it names the peer that gossiped about it. First-hand contacts refresh
    /// the online statistics that drive eviction and maintenance. Status
    /// listeners hear `on_online` for first-hand peers that pass admission,
    /// even if the table then has no room for them.
    pub fn peer_found(&self, remote: &PeerAddress, referrer: Option<&PeerAddress>) -> FoundOutcome {
        let id = remote.id();
        if id.is_zero() {
            return FoundOutcome::Rejected(Rejection::ZeroId);
        }
        let Some(class) = self.class_of(&id) else {
            return FoundOutcome::Rejected(Rejection::SelfId);
        };

        let first_hand = referrer.is_none();
        let now = Instant::now();
        if first_hand {
            lock(&self.offline).clear_soft(&id, now);
        }

        if let Some(rejection) = self.admission_check(remote, referrer, now) {
            trace!(peer = %remote, ?rejection, "peer refused");
            return FoundOutcome::Rejected(rejection);
        }
        if first_hand {
            self.notify_online(remote);
        }

        let slot = match self.insert_or_update(class, remote) {
            Some(slot) => slot,
            None => {
                if !self.evict_for(class) {
                    trace!(peer = %remote, class, "table full, no farther over-full class");
                    return FoundOutcome::Rejected(Rejection::Full);
                }
                match self.insert_or_update(class, remote) {
                    Some(slot) => slot,
                    None => return FoundOutcome::Rejected(Rejection::Full),
                }
            }
        };

        match slot {
            Slot::Inserted(statistic) => {
                self.refresh_statistic(remote, &statistic, first_hand, now);
                debug!(peer = %remote, class, verified = first_hand, "peer inserted");
                self.notify_inserted(remote, first_hand);
                FoundOutcome::Inserted
            }
            Slot::Updated(statistic) => {
                self.refresh_statistic(remote, &statistic, first_hand, now);
                trace!(peer = %remote, class, "peer updated");
                self.notify_updated(remote);
                FoundOutcome::Updated
            }
        }
    }

    fn admission_check(
        &self,
        remote: &PeerAddress,
        referrer: Option<&PeerAddress>,
        now: Instant,
    ) -> Option<Rejection> {
        let id = remote.id();
        if lock(&self.offline).is_banned(&id, now) {
            return Some(Rejection::Offline);
        }
        if read(&self.filtered_addresses).contains(&remote.ip()) {
            return Some(Rejection::AddressFiltered);
        }
        if self
            .config
            .peer_filters
            .iter()
            .any(|filter| filter.reject(remote, referrer))
        {
            return Some(Rejection::PolicyFiltered);
        }
        if self.config.reject_firewalled && remote.is_firewalled_tcp() {
            return Some(Rejection::Firewalled);
        }
        if referrer.is_some() && self.config.first_hand_only && !self.contains(&id) {
            return Some(Rejection::NotFirstHand);
        }
        None
    }

    /// Refresh a known peer in place, or claim a slot for a new one.
    /// Returns `None` when the table is at its cap.
    fn insert_or_update(&self, class: usize, remote: &PeerAddress) -> Option<Slot> {
        let mut bucket = lock(&self.buckets[class]);
        if let Some(entry) = bucket.peers.get_mut(&remote.id()) {
            entry.address = remote.clone();
            return Some(Slot::Updated(Arc::clone(&entry.statistic)));
        }

        let max_peers = self.max_peers;
        self.peer_count
            .fetch_update(atomic::Ordering::SeqCst, atomic::Ordering::SeqCst, |count| {
                (count < max_peers).then_some(count + 1)
            })
            .ok()?;

        let statistic = Arc::new(PeerStatistic::new());
        bucket.peers.insert(
            remote.id(),
            PeerEntry {
                address: remote.clone(),
                statistic: Arc::clone(&statistic),
            },
        );
        Some(Slot::Inserted(statistic))
    }

    /// Free a slot for a peer of class `class`, if a farther class is
    /// over-full.
    fn evict_for(&self, class: usize) -> bool {
        let Some((victim_class, victim)) = self.eviction_candidate() else {
            return false;
        };
        if victim_class <= class {
            return false;
        }
        debug!(peer = %victim, from_class = victim_class, for_class = class, "evicting peer");
        self.remove(&victim, RemovalReason::RemovedFromMap)
    }

    fn eviction_candidate(&self) -> Option<(usize, PeerAddress)> {
        for class in (0..NUM_CLASSES).rev() {
            let bucket = lock(&self.buckets[class]);
            if bucket.peers.len() > self.config.bag_size {
                return bucket
                    .least_recently_online()
                    .map(|entry| (class, entry.address.clone()));
            }
        }
        None
    }

    fn ladder_step(&self, checked: u32) -> Option<Duration> {
        let ladder = &self.config.maintenance_ladder;
        let index = usize::try_from(checked)
            .unwrap_or(usize::MAX)
            .min(ladder.len().saturating_sub(1));
        ladder.get(index).copied()
    }

    fn refresh_statistic(
        &self,
        remote: &PeerAddress,
        statistic: &PeerStatistic,
        first_hand: bool,
        now: Instant,
    ) {
        if first_hand {
            statistic.set_seen_online(now);
            if let Some(step) = self.ladder_step(statistic.checked()) {
                if statistic.online_time() >= step {
                    statistic.increment_checked();
                }
            }
        }
        self.schedule_maintenance(remote, statistic, now);
    }

    /// Peers never seen online are due immediately; the others climb the
    /// ladder with every passed check.
    fn schedule_maintenance(&self, remote: &PeerAddress, statistic: &PeerStatistic, now: Instant) {
        let Some(step) = self.ladder_step(statistic.checked()) else {
            return;
        };
        let at = match statistic.last_seen_online() {
            None => now,
            Some(_) => now + step,
        };
        lock(&self.maintenance).schedule(remote.clone(), at);
    }

    /// Report a failed contact.
    ///
    /// A soft failure counts towards the offline threshold and schedules an
    /// immediate re-check. Reaching the threshold, or `force`, removes the
    /// peer and bans it for the offline window. Returns whether the peer was
    /// removed from the table.
    pub fn peer_offline(&self, remote: &PeerAddress, force: bool) -> bool {
        let id = remote.id();
        if id.is_zero() || id == self.self_id {
            return false;
        }
        let now = Instant::now();
        self.notify_fail(remote, force);

        let verdict = {
            let mut offline = lock(&self.offline);
            if force {
                offline.ban(id, now);
                FailureVerdict::Exclude
            } else if offline.is_banned(&id, now) {
                FailureVerdict::Exclude
            } else {
                offline.record_failure(id, now)
            }
        };

        match verdict {
            FailureVerdict::Soft(failures) => {
                debug!(peer = %remote, failures, "peer check failed");
                if let Some((address, statistic)) = self.entry(&id) {
                    statistic.reset();
                    self.schedule_maintenance(&address, &statistic, now);
                }
                false
            }
            FailureVerdict::Exclude => {
                let reason = if force {
                    RemovalReason::RemovedFromMap
                } else {
                    RemovalReason::NotReachable
                };
                self.remove(remote, reason)
            }
        }
    }

    /// Remove a peer and emit the removal and offline notifications.
    /// Returns whether the peer was in the table.
    pub fn remove(&self, remote: &PeerAddress, reason: RemovalReason) -> bool {
        let id = remote.id();
        let Some(class) = self.class_of(&id) else {
            return false;
        };
        let removed = lock(&self.buckets[class]).peers.remove(&id);
        let was_present = removed.is_some();
        if let Some(entry) = removed {
            lock(&self.maintenance).remove(&id);
            self.peer_count.fetch_sub(1, atomic::Ordering::SeqCst);
            debug!(peer = %entry.address, %reason, "peer removed");
            self.notify_removed(&entry.address, reason);
        }
        self.notify_offline(remote, reason);
        was_present
    }

    /// Peers sorted by ascending XOR distance to `key`.
    ///
    /// The key's own class is collected first, then every closer class, then
    /// farther classes until at least `at_least` peers are gathered. The
    /// result may hold more than `at_least` peers. For the local identifier
    /// the classes are walked outward from class 0.
    pub fn close_peers(&self, key: &Id, at_least: usize) -> Vec<PeerAddress> {
        let mut found = BTreeMap::new();
        match self.class_of(key) {
            None => {
                for class in 0..NUM_CLASSES {
                    if found.len() >= at_least {
                        break;
                    }
                    self.collect_class(class, key, &mut found);
                }
            }
            Some(key_class) => {
                self.collect_class(key_class, key, &mut found);
                if found.len() < at_least {
                    for class in (0..key_class).rev() {
                        self.collect_class(class, key, &mut found);
                    }
                }
                for class in key_class + 1..NUM_CLASSES {
                    if found.len() >= at_least {
                        break;
                    }
                    self.collect_class(class, key, &mut found);
                }
            }
        }
        found.into_values().collect()
    }

    fn collect_class(&self, class: usize, key: &Id, found: &mut BTreeMap<Id, PeerAddress>) {
        let bucket = lock(&self.buckets[class]);
        for entry in bucket.peers.values() {
            found.insert(key.xor(&entry.address.id()), entry.address.clone());
        }
    }

    /// Dequeue every peer whose re-check is due.
    pub fn peers_for_maintenance(&self) -> Vec<PeerAddress> {
        lock(&self.maintenance).take_due(Instant::now())
    }

    /// When `id` is next due for a re-check.
    pub fn maintenance_due(&self, id: &Id) -> Option<Instant> {
        lock(&self.maintenance).scheduled_at(id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.class_of(id)
            .is_some_and(|class| lock(&self.buckets[class]).peers.contains_key(id))
    }

    /// The stored address for `id`.
    pub fn get(&self, id: &Id) -> Option<PeerAddress> {
        self.entry(id).map(|(address, _)| address)
    }

    fn entry(&self, id: &Id) -> Option<(PeerAddress, Arc<PeerStatistic>)> {
        let class = self.class_of(id)?;
        let bucket = lock(&self.buckets[class]);
        bucket
            .peers
            .get(id)
            .map(|entry| (entry.address.clone(), Arc::clone(&entry.statistic)))
    }

    pub fn statistic(&self, id: &Id) -> Option<Arc<PeerStatistic>> {
        self.entry(id).map(|(_, statistic)| statistic)
    }

    /// Add a round-trip sample for a peer in the table.
    pub fn record_rtt(&self, id: &Id, rtt: Duration) -> bool {
        match self.statistic(id) {
            Some(statistic) => {
                statistic.add_rtt(rtt);
                true
            }
            None => false,
        }
    }

    /// Every peer in the table, closest class first.
    pub fn all(&self) -> Vec<PeerAddress> {
        let mut peers = Vec::with_capacity(self.size());
        for bucket in &self.buckets {
            let bucket = lock(bucket);
            peers.extend(bucket.peers.values().map(|entry| entry.address.clone()));
        }
        peers
    }

    /// Peers in one distance class.
    pub fn peers_in_class(&self, class: usize) -> Vec<PeerAddress> {
        self.buckets
            .get(class)
            .map(|bucket| {
                lock(bucket)
                    .peers
                    .values()
                    .map(|entry| entry.address.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Occupancy of every class, indexed by class.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .map(|bucket| lock(bucket).peers.len())
            .collect()
    }

    /// Whether the offline log currently bans this peer.
    pub fn is_peer_removed_temporarily(&self, remote: &PeerAddress) -> bool {
        lock(&self.offline).is_banned(&remote.id(), Instant::now())
    }

    /// Refuse peers announcing `ip` from now on.
    pub fn add_address_filter(&self, ip: IpAddr) {
        write(&self.filtered_addresses).insert(ip);
    }

    pub fn add_change_listener(&self, listener: Arc<dyn PeerMapChangeListener>) {
        write(&self.listeners).change.push(listener);
    }

    pub fn remove_change_listener(&self, listener: &Arc<dyn PeerMapChangeListener>) -> bool {
        let mut listeners = write(&self.listeners);
        let before = listeners.change.len();
        listeners.change.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.change.len() != before
    }

    pub fn add_status_listener(&self, listener: Arc<dyn PeerStatusListener>) {
        write(&self.listeners).status.push(listener);
    }

    pub fn remove_status_listener(&self, listener: &Arc<dyn PeerStatusListener>) -> bool {
        let mut listeners = write(&self.listeners);
        let before = listeners.status.len();
        listeners.status.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.status.len() != before
    }

    fn change_listeners(&self) -> Vec<Arc<dyn PeerMapChangeListener>> {
        read(&self.listeners).change.clone()
    }

    fn status_listeners(&self) -> Vec<Arc<dyn PeerStatusListener>> {
        read(&self.listeners).status.clone()
    }

    fn notify_inserted(&self, peer: &PeerAddress, verified: bool) {
        for listener in self.change_listeners() {
            listener.on_inserted(peer, verified);
        }
    }

    fn notify_updated(&self, peer: &PeerAddress) {
        for listener in self.change_listeners() {
            listener.on_updated(peer);
        }
    }

    fn notify_removed(&self, peer: &PeerAddress, reason: RemovalReason) {
        for listener in self.change_listeners() {
            listener.on_removed(peer, reason);
        }
    }

    fn notify_online(&self, peer: &PeerAddress) {
        for listener in self.status_listeners() {
            listener.on_online(peer);
        }
    }

    fn notify_fail(&self, peer: &PeerAddress, force: bool) {
        for listener in self.status_listeners() {
            listener.on_fail(peer, force);
        }
    }

    fn notify_offline(&self, peer: &PeerAddress, reason: RemovalReason) {
        for listener in self.status_listeners() {
            listener.on_offline(peer, reason);
        }
    }
}

impl fmt::Display for PeerMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PeerMap[self={}, size={}]", self.self_id, self.size())?;
        for (class, bucket) in self.buckets.iter().enumerate() {
            let bucket = lock(bucket);
            if bucket.peers.is_empty() {
                continue;
            }
            let mut peers: Vec<&PeerAddress> =
                bucket.peers.values().map(|entry| &entry.address).collect();
            peers.sort();
            write!(f, "  class {class}:")?;
            for peer in peers {
                write!(f, " {}", peer.id())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerMap")
            .field("self_id", &self.self_id)
            .field("size", &self.size())
            .field("max_peers", &self.max_peers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn peer(id: u64) -> PeerAddress {
        PeerAddress::new(
            Id::from_u64(id),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            4000,
            4000,
        )
    }

    fn table(config: PeerMapConfig) -> PeerMap {
        PeerMap::new(config).expect("valid config")
    }

    #[derive(Default)]
    struct Recorder {
        inserted: Mutex<Vec<(Id, bool)>>,
        updated: Mutex<Vec<Id>>,
        removed: Mutex<Vec<(Id, RemovalReason)>>,
        online: Mutex<Vec<Id>>,
        offline: Mutex<Vec<(Id, RemovalReason)>>,
    }

    impl PeerMapChangeListener for Recorder {
        fn on_inserted(&self, peer: &PeerAddress, verified: bool) {
            lock(&self.inserted).push((peer.id(), verified));
        }

        fn on_updated(&self, peer: &PeerAddress) {
            lock(&self.updated).push(peer.id());
        }

        fn on_removed(&self, peer: &PeerAddress, reason: RemovalReason) {
            lock(&self.removed).push((peer.id(), reason));
        }
    }

    impl PeerStatusListener for Recorder {
        fn on_online(&self, peer: &PeerAddress) {
            lock(&self.online).push(peer.id());
        }

        fn on_offline(&self, peer: &PeerAddress, reason: RemovalReason) {
            lock(&self.offline).push((peer.id(), reason));
        }
    }

    fn recorded(map: &PeerMap) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        map.add_change_listener(recorder.clone());
        map.add_status_listener(recorder.clone());
        recorder
    }

    #[test]
    fn test_new_rejects_zero_self() {
        assert_eq!(
            PeerMap::new(PeerMapConfig::new(Id::ZERO)).err(),
            Some(DhtError::ZeroId)
        );
    }

    #[test]
    fn test_rejects_zero_and_self() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        assert_eq!(
            map.peer_found(&peer(0), None),
            FoundOutcome::Rejected(Rejection::ZeroId)
        );
        assert_eq!(
            map.peer_found(&peer(1), None),
            FoundOutcome::Rejected(Rejection::SelfId)
        );
        assert!(map.is_empty());
        assert!(!map.peer_offline(&peer(1), true));
    }

    #[test]
    fn test_distance_class_invariant() {
        let self_id = Id::from_u64(0x55);
        let map = table(PeerMapConfig::new(self_id).bag_size(64));
        for id in 1..=300u64 {
            map.peer_found(&peer(id), None);
        }
        assert_eq!(map.size(), 299);
        for class in 0..NUM_CLASSES {
            for member in map.peers_in_class(class) {
                assert_eq!(self_id.class_of(&member.id()), Some(class));
            }
        }
        assert_eq!(map.bucket_sizes().iter().sum::<usize>(), map.size());
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut rng = StdRng::seed_from_u64(7);
        let self_id = Id::random(&mut rng);
        let map = table(PeerMapConfig::new(self_id).bag_size(1));
        for _ in 0..2000 {
            let id = Id::random(&mut rng);
            map.peer_found(&PeerAddress::from_id(id), None);
            assert!(map.size() <= map.max_peers());
        }
        assert_eq!(map.bucket_sizes().iter().sum::<usize>(), map.size());
    }

    #[test]
    fn test_eviction_prefers_closer_peer() {
        let self_id = Id::from_u64(1);
        let map = table(
            PeerMapConfig::new(self_id)
                .bag_size(1)
                .max_peers_override(2),
        );
        let recorder = recorded(&map);

        let far_seen = peer(1 ^ (1 << 40));
        let far_gossip = peer(1 ^ (1 << 40) ^ 2);
        assert_eq!(map.peer_found(&far_seen, None), FoundOutcome::Inserted);
        assert_eq!(
            map.peer_found(&far_gossip, Some(&far_seen)),
            FoundOutcome::Inserted
        );
        assert_eq!(map.bucket_sizes()[40], 2);

        let close = peer(1 ^ 8);
        assert_eq!(map.class_of(&close.id()), Some(3));
        assert_eq!(map.peer_found(&close, None), FoundOutcome::Inserted);
        assert_eq!(map.size(), 2);
        assert!(map.contains(&far_seen.id()));
        assert!(!map.contains(&far_gossip.id()));
        assert_eq!(
            lock(&recorder.removed).as_slice(),
            &[(far_gossip.id(), RemovalReason::RemovedFromMap)]
        );

        // Nothing is over-full any more.
        let other = peer(1 ^ 4);
        assert_eq!(
            map.peer_found(&other, None),
            FoundOutcome::Rejected(Rejection::Full)
        );
    }

    #[test]
    fn test_eviction_refuses_farther_candidate() {
        let self_id = Id::from_u64(1);
        let map = table(
            PeerMapConfig::new(self_id)
                .bag_size(1)
                .max_peers_override(2),
        );
        map.peer_found(&peer(1 ^ (1 << 10)), None);
        map.peer_found(&peer(1 ^ (1 << 10) ^ 2), None);

        let farther = peer(1 ^ (1 << 20));
        assert_eq!(
            map.peer_found(&farther, None),
            FoundOutcome::Rejected(Rejection::Full)
        );
        assert_eq!(map.size(), 2);
        assert_eq!(map.bucket_sizes()[10], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_round_trip() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        let recorder = recorded(&map);
        let remote = peer(0x40);
        map.peer_found(&remote, None);

        assert!(!map.peer_offline(&remote, false));
        assert!(map.contains(&remote.id()));
        assert!(map.peer_offline(&remote, false));
        assert!(!map.contains(&remote.id()));
        assert!(map
            .close_peers(&remote.id(), 10)
            .iter()
            .all(|p| p.id() != remote.id()));
        assert_eq!(
            lock(&recorder.removed).as_slice(),
            &[(remote.id(), RemovalReason::NotReachable)]
        );

        assert!(map.is_peer_removed_temporarily(&remote));
        assert_eq!(
            map.peer_found(&remote, None),
            FoundOutcome::Rejected(Rejection::Offline)
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!map.is_peer_removed_temporarily(&remote));
        assert_eq!(map.peer_found(&remote, None), FoundOutcome::Inserted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_offline() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        let recorder = recorded(&map);
        let remote = peer(0x40);
        map.peer_found(&remote, None);

        assert!(map.peer_offline(&remote, true));
        assert_eq!(map.size(), 0);
        assert_eq!(
            lock(&recorder.offline).as_slice(),
            &[(remote.id(), RemovalReason::RemovedFromMap)]
        );
        assert!(map.is_peer_removed_temporarily(&remote));

        // Offline notification is emitted even for unknown peers.
        assert!(!map.peer_offline(&peer(0x41), true));
        assert_eq!(lock(&recorder.offline).len(), 2);
        assert_eq!(lock(&recorder.removed).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_hand_contact_clears_soft_failure() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        let recorder = recorded(&map);
        let remote = peer(0x40);
        map.peer_found(&remote, None);

        assert!(!map.peer_offline(&remote, false));
        map.peer_found(&remote, None);
        assert!(!map.peer_offline(&remote, false));
        assert!(map.contains(&remote.id()));
        assert_eq!(lock(&recorder.online).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_peer_not_reported_online() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        let recorder = recorded(&map);
        let remote = peer(0x40);
        map.peer_found(&remote, None);
        assert!(map.peer_offline(&remote, true));
        assert_eq!(lock(&recorder.online).as_slice(), &[remote.id()]);

        assert_eq!(
            map.peer_found(&remote, None),
            FoundOutcome::Rejected(Rejection::Offline)
        );
        assert_eq!(
            map.peer_found(&peer(0x41).with_firewalled_tcp(true), None),
            FoundOutcome::Rejected(Rejection::Firewalled)
        );
        map.add_address_filter(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(
            map.peer_found(&peer(0x42), None),
            FoundOutcome::Rejected(Rejection::AddressFiltered)
        );
        assert_eq!(lock(&recorder.online).as_slice(), &[remote.id()]);
    }

    #[test]
    fn test_close_peers_sorted() {
        let map = table(PeerMapConfig::new(Id::from_u64(0x13)).bag_size(8));
        for id in 2..=120u64 {
            map.peer_found(&peer(id), None);
        }
        for key in [0x13u64, 0x2a, 0x77, 0x1000, 5] {
            let key = Id::from_u64(key);
            let result = map.close_peers(&key, 6);
            assert!(result.len() >= 6);
            for pair in result.windows(2) {
                assert_eq!(
                    PeerMap::is_closer(&key, &pair[0].id(), &pair[1].id()),
                    Ordering::Less
                );
            }
            let best = map
                .all()
                .into_iter()
                .min_by(|a, b| PeerMap::is_closer(&key, &a.id(), &b.id()))
                .expect("table not empty");
            assert_eq!(result[0].id(), best.id());
        }
    }

    #[test]
    fn test_close_peers_empty_table() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        assert!(map.close_peers(&Id::from_u64(9), 0).is_empty());
        assert!(map.close_peers(&Id::from_u64(9), 5).is_empty());
        assert!(map.close_peers(&Id::from_u64(1), 5).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_found_twice_is_idempotent() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        let recorder = recorded(&map);
        let remote = peer(0x40);

        assert_eq!(map.peer_found(&remote, None), FoundOutcome::Inserted);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(map.peer_found(&remote, None), FoundOutcome::Updated);

        assert_eq!(map.size(), 1);
        let statistic = map.statistic(&remote.id()).expect("statistic");
        assert_eq!(statistic.online_time(), Duration::from_secs(5));
        assert_eq!(statistic.checked(), 1);
        assert_eq!(lock(&recorder.inserted).as_slice(), &[(remote.id(), true)]);
        assert_eq!(lock(&recorder.updated).as_slice(), &[remote.id()]);
    }

    #[test]
    fn test_endpoint_change_replaces_address() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        let remote = peer(0x40);
        map.peer_found(&remote, None);
        map.record_rtt(&remote.id(), Duration::from_millis(12));

        let moved = remote.with_ports(5000, 5001);
        assert_eq!(map.peer_found(&moved, None), FoundOutcome::Updated);
        let stored = map.get(&remote.id()).expect("stored");
        assert_eq!(stored.tcp_port(), 5000);
        assert_eq!(stored.udp_port(), 5001);
        let statistic = map.statistic(&remote.id()).expect("statistic");
        assert_eq!(statistic.mean_rtt(), Some(Duration::from_millis(12)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_schedule() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        let seen = peer(0x40);
        let gossip = peer(0x41);
        map.peer_found(&seen, None);
        map.peer_found(&gossip, Some(&seen));

        let due = map.peers_for_maintenance();
        assert_eq!(due, vec![gossip.clone()]);
        assert!(map.peers_for_maintenance().is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(map.peers_for_maintenance(), vec![seen.clone()]);

        // A passed check moves the peer one step up the ladder.
        map.peer_found(&seen, None);
        assert_eq!(
            map.maintenance_due(&seen.id()),
            Some(Instant::now() + Duration::from_secs(10))
        );

        // A failed check schedules an immediate re-check.
        map.peer_offline(&seen, false);
        assert_eq!(map.peers_for_maintenance(), vec![seen.clone()]);

        map.remove(&gossip, RemovalReason::RemovedFromMap);
        assert_eq!(map.maintenance_due(&gossip.id()), None);
    }

    #[test]
    fn test_admission_policies() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)).first_hand_only(true));
        let firewalled = peer(0x40).with_firewalled_tcp(true);
        assert_eq!(
            map.peer_found(&firewalled, None),
            FoundOutcome::Rejected(Rejection::Firewalled)
        );

        let referrer = peer(0x50);
        assert_eq!(
            map.peer_found(&peer(0x41), Some(&referrer)),
            FoundOutcome::Rejected(Rejection::NotFirstHand)
        );
        map.peer_found(&peer(0x41), None);
        assert_eq!(
            map.peer_found(&peer(0x41), Some(&referrer)),
            FoundOutcome::Updated
        );

        let open = table(PeerMapConfig::new(Id::from_u64(1)).reject_firewalled(false));
        assert_eq!(open.peer_found(&firewalled, None), FoundOutcome::Inserted);
    }

    #[test]
    fn test_filters() {
        let only_even = |candidate: &PeerAddress, _: Option<&PeerAddress>| {
            candidate.id().low_u64() % 2 == 1
        };
        let map = table(PeerMapConfig::new(Id::from_u64(1)).peer_filter(Arc::new(only_even)));
        assert_eq!(
            map.peer_found(&peer(0x41), None),
            FoundOutcome::Rejected(Rejection::PolicyFiltered)
        );
        assert_eq!(map.peer_found(&peer(0x42), None), FoundOutcome::Inserted);

        map.add_address_filter(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(
            map.peer_found(&peer(0x44), None),
            FoundOutcome::Rejected(Rejection::AddressFiltered)
        );
    }

    #[test]
    fn test_listener_deregistration() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn PeerMapChangeListener> = recorder.clone();
        map.add_change_listener(Arc::clone(&listener));
        map.peer_found(&peer(0x40), None);
        assert!(map.remove_change_listener(&listener));
        assert!(!map.remove_change_listener(&listener));
        map.peer_found(&peer(0x41), None);
        assert_eq!(lock(&recorder.inserted).len(), 1);
    }

    #[test]
    fn test_concurrent_inserts_respect_cap() {
        let mut rng = StdRng::seed_from_u64(11);
        let self_id = Id::random(&mut rng);
        let map = table(PeerMapConfig::new(self_id).bag_size(1).max_peers_override(40));
        let batches: Vec<Vec<Id>> = (0..4)
            .map(|_| (0..500).map(|_| Id::random(&mut rng)).collect())
            .collect();
        std::thread::scope(|scope| {
            for batch in &batches {
                let map = &map;
                scope.spawn(move || {
                    for id in batch {
                        map.peer_found(&PeerAddress::from_id(*id), None);
                    }
                });
            }
        });
        assert!(map.size() <= 40);
        assert_eq!(map.bucket_sizes().iter().sum::<usize>(), map.size());
        assert_eq!(map.all().len(), map.size());
    }

    #[test]
    fn test_display_lists_classes() {
        let map = table(PeerMapConfig::new(Id::from_u64(1)));
        map.peer_found(&peer(3), None);
        let rendered = map.to_string();
        assert!(rendered.contains("size=1"));
        assert!(rendered.contains("class 1: 0x3"));
    }
}
