//! Notification and admission hooks around the routing table.
//!
//! Listeners are invoked after the table has finished mutating and with no
//! internal lock held, so a listener may call back into the table.

use std::fmt;

use kadmesh_types::PeerAddress;

/// Why a peer left the table (or was reported offline).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// The peer failed too many checks within the offline window.
    NotReachable,
    /// The peer was removed explicitly, either forced offline or evicted to
    /// make room for a closer peer.
    RemovedFromMap,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::NotReachable => write!(f, "not-reachable"),
            RemovalReason::RemovedFromMap => write!(f, "removed-from-map"),
        }
    }
}

/// Membership changes of the routing table.
pub trait PeerMapChangeListener: Send + Sync {
    /// A peer was added. `verified` is true for first-hand contacts.
    fn on_inserted(&self, peer: &PeerAddress, verified: bool);

    /// A known peer was seen again, possibly under a new endpoint.
    fn on_updated(&self, peer: &PeerAddress) {
        let _ = peer;
    }

    /// A peer left the table.
    fn on_removed(&self, peer: &PeerAddress, reason: RemovalReason);
}

/// Liveness transitions, reported whether or not the peer is in the table.
pub trait PeerStatusListener: Send + Sync {
    fn on_online(&self, peer: &PeerAddress) {
        let _ = peer;
    }

    /// A check failed. `force` is true for explicit removal requests.
    fn on_fail(&self, peer: &PeerAddress, force: bool) {
        let _ = (peer, force);
    }

    fn on_offline(&self, peer: &PeerAddress, reason: RemovalReason) {
        let _ = (peer, reason);
    }
}

/// Admission policy consulted before a peer is inserted.
pub trait PeerFilter: Send + Sync {
    /// Return true to refuse `peer`. `referrer` is `None` for first-hand
    /// contacts.
    fn reject(&self, peer: &PeerAddress, referrer: Option<&PeerAddress>) -> bool;
}

impl<F> PeerFilter for F
where
    F: Fn(&PeerAddress, Option<&PeerAddress>) -> bool + Send + Sync,
{
    fn reject(&self, peer: &PeerAddress, referrer: Option<&PeerAddress>) -> bool {
        self(peer, referrer)
    }
}
