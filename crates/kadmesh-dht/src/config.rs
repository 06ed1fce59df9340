//! Routing table configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kadmesh_types::Id;

use crate::listener::PeerFilter;
use crate::{
    DhtError, Result, DEFAULT_BAG_SIZE, DEFAULT_MAINTENANCE_LADDER_SECS,
    DEFAULT_OFFLINE_CACHE_SIZE, DEFAULT_OFFLINE_COUNT, DEFAULT_OFFLINE_TIMEOUT_SECS,
    NUM_CLASSES,
};

/// Options consumed by [`crate::PeerMap::new`].
///
/// Built fluently from [`PeerMapConfig::new`], which fills in the defaults:
///
/// ```
/// use std::time::Duration;
/// use kadmesh_dht::PeerMapConfig;
/// use kadmesh_types::Id;
///
/// let config = PeerMapConfig::new(Id::from_u64(7))
///     .bag_size(4)
///     .offline_timeout(Duration::from_secs(30));
/// assert_eq!(config.max_peers(), 4 * 160);
/// ```
#[derive(Clone)]
pub struct PeerMapConfig {
    pub(crate) self_id: Id,
    pub(crate) bag_size: usize,
    pub(crate) max_peers: Option<usize>,
    pub(crate) offline_timeout: Duration,
    pub(crate) offline_count: u32,
    pub(crate) offline_cache_size: usize,
    pub(crate) maintenance_ladder: Vec<Duration>,
    pub(crate) reject_firewalled: bool,
    pub(crate) first_hand_only: bool,
    pub(crate) peer_filters: Vec<Arc<dyn PeerFilter>>,
}

impl PeerMapConfig {
    /// Defaults for a table centred on `self_id`.
    pub fn new(self_id: Id) -> Self {
        Self {
            self_id,
            bag_size: DEFAULT_BAG_SIZE,
            max_peers: None,
            offline_timeout: Duration::from_secs(DEFAULT_OFFLINE_TIMEOUT_SECS),
            offline_count: DEFAULT_OFFLINE_COUNT,
            offline_cache_size: DEFAULT_OFFLINE_CACHE_SIZE,
            maintenance_ladder: DEFAULT_MAINTENANCE_LADDER_SECS
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            reject_firewalled: true,
            first_hand_only: false,
            peer_filters: Vec::new(),
        }
    }

    /// Peers kept per distance class before the class counts as over-full.
    pub fn bag_size(mut self, bag_size: usize) -> Self {
        self.bag_size = bag_size;
        self
    }

    /// Cap on the total number of peers. Defaults to `bag_size x 160`.
    pub fn max_peers_override(mut self, max_peers: usize) -> Self {
        self.max_peers = Some(max_peers);
        self
    }

    /// How long an offline-log entry stays live after the last failure.
    pub fn offline_timeout(mut self, timeout: Duration) -> Self {
        self.offline_timeout = timeout;
        self
    }

    /// Failures within the offline window before a peer is removed and banned.
    pub fn offline_count(mut self, count: u32) -> Self {
        self.offline_count = count;
        self
    }

    /// Capacity of the offline log; the least recently touched entry is
    /// dropped when it overflows.
    pub fn offline_cache_size(mut self, size: usize) -> Self {
        self.offline_cache_size = size;
        self
    }

    /// Re-check intervals, indexed by how many checks a peer has passed.
    /// An empty ladder disables maintenance scheduling.
    pub fn maintenance_ladder(mut self, ladder: Vec<Duration>) -> Self {
        self.maintenance_ladder = ladder;
        self
    }

    /// Refuse peers that announce a firewalled TCP port.
    pub fn reject_firewalled(mut self, reject: bool) -> Self {
        self.reject_firewalled = reject;
        self
    }

    /// Only admit new peers learned by direct contact.
    pub fn first_hand_only(mut self, first_hand_only: bool) -> Self {
        self.first_hand_only = first_hand_only;
        self
    }

    /// Add an admission filter. A peer rejected by any filter is not inserted.
    pub fn peer_filter(mut self, filter: Arc<dyn PeerFilter>) -> Self {
        self.peer_filters.push(filter);
        self
    }

    /// The local identifier.
    pub fn self_id(&self) -> Id {
        self.self_id
    }

    /// Effective peer cap.
    pub fn max_peers(&self) -> usize {
        self.max_peers
            .unwrap_or_else(|| self.bag_size.saturating_mul(NUM_CLASSES))
    }

    /// Check the construction contract.
    pub fn validate(&self) -> Result<()> {
        if self.self_id.is_zero() {
            return Err(DhtError::ZeroId);
        }
        if self.bag_size == 0 {
            return Err(DhtError::InvalidConfig(
                "bag size must be positive".to_string(),
            ));
        }
        if self.max_peers() == 0 {
            return Err(DhtError::InvalidConfig(
                "peer cap must be positive".to_string(),
            ));
        }
        if self.offline_count == 0 {
            return Err(DhtError::InvalidConfig(
                "offline count must be positive".to_string(),
            ));
        }
        if self.offline_cache_size == 0 {
            return Err(DhtError::InvalidConfig(
                "offline cache must hold at least one entry".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PeerMapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerMapConfig")
            .field("self_id", &self.self_id)
            .field("bag_size", &self.bag_size)
            .field("max_peers", &self.max_peers())
            .field("offline_timeout", &self.offline_timeout)
            .field("offline_count", &self.offline_count)
            .field("offline_cache_size", &self.offline_cache_size)
            .field("maintenance_ladder", &self.maintenance_ladder)
            .field("reject_firewalled", &self.reject_firewalled)
            .field("first_hand_only", &self.first_hand_only)
            .field("peer_filters", &self.peer_filters.len())
            .finish()
    }
}
