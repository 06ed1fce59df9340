//! Outbound replica transfer.

use std::collections::BTreeMap;

use kadmesh_types::{Bytes, CompositeKey, Id, PeerAddress};

use crate::pending::Pending;

/// Moves a snapshot of one location to another peer.
///
/// Implementations must not block: start the transfer and return a
/// [`Pending`] that resolves when the remote side has acknowledged it.
/// Timeouts are the sender's business.
pub trait ReplicaSender: Send + Sync {
    fn send_replica(
        &self,
        target: &PeerAddress,
        location: Id,
        data: BTreeMap<CompositeKey, Bytes>,
    ) -> Pending;
}
