//! Responsibility notifications.

use kadmesh_types::{Id, PeerAddress};

use crate::pending::Pending;

/// Receives responsibility changes decided by [`crate::Replication`].
///
/// Every method must return promptly; the actual work completes through the
/// returned [`Pending`].
pub trait ResponsibilityListener: Send + Sync {
    /// The local peer became responsible for `location`, or the replica set
    /// around it changed and needs to be refreshed.
    fn on_me_responsible(&self, location: Id) -> Pending;

    /// The local peer is still responsible for `location` and `peer` just
    /// joined its replica set.
    fn on_me_responsible_for(&self, location: Id, peer: &PeerAddress) -> Pending;

    /// `target` is now responsible for `location`.
    fn on_other_responsible(&self, location: Id, target: &PeerAddress) -> Pending;
}
