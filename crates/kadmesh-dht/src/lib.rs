//! # kadmesh-dht
//!
//! Kademlia-style routing table for the kadmesh overlay.
//!
//! This crate implements:
//! - [`PeerMap`]: 160 distance-class buckets around the local identifier with
//!   bag-size bounded classes, eviction that favours close peers, and
//!   proximity queries ordered by XOR distance
//! - A per-peer offline log that bans repeatedly unreachable peers for a
//!   configurable window
//! - A maintenance queue whose re-check interval climbs a timeout ladder as a
//!   peer stays online
//! - Membership-change and status listener traits plus injectable peer filters
//!
//! ## Default Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | bag size (peers per class) | 2 |
//! | peer cap | bag size x 160 |
//! | offline window | 60 seconds |
//! | failures before exclusion | 2 |
//! | offline cache entries | 100 |
//! | maintenance ladder | 5, 10, 20, 40, 80, 160 seconds |

pub mod config;
pub mod listener;
pub mod maintenance;
pub mod offline;
pub mod peer_map;
pub mod statistic;

pub use config::PeerMapConfig;
pub use listener::{PeerFilter, PeerMapChangeListener, PeerStatusListener, RemovalReason};
pub use peer_map::{FoundOutcome, PeerMap, Rejection};
pub use statistic::PeerStatistic;

/// Number of distance classes (one per bit of the identifier space).
pub const NUM_CLASSES: usize = kadmesh_types::Id::BITS;

/// Default number of peers kept per distance class.
pub const DEFAULT_BAG_SIZE: usize = 2;

/// Default offline window in seconds.
pub const DEFAULT_OFFLINE_TIMEOUT_SECS: u64 = 60;

/// Default number of failures within the offline window before a peer is
/// excluded.
pub const DEFAULT_OFFLINE_COUNT: u32 = 2;

/// Default capacity of the offline log.
pub const DEFAULT_OFFLINE_CACHE_SIZE: usize = 100;

/// Default maintenance ladder in seconds.
pub const DEFAULT_MAINTENANCE_LADDER_SECS: [u64; 6] = [5, 10, 20, 40, 80, 160];

/// Error types for routing table construction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DhtError {
    /// The supplied configuration violates a construction contract.
    #[error("invalid routing table configuration: {0}")]
    InvalidConfig(String),

    /// The zero identifier was used where a peer identifier is required.
    #[error("the zero identifier is not a valid peer id")]
    ZeroId,
}

/// Convenience result type for routing table operations.
pub type Result<T> = std::result::Result<T, DhtError>;
