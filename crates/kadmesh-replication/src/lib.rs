//! # kadmesh-replication
//!
//! Replica responsibility tracking on top of the kadmesh routing table.
//!
//! ## Modules
//!
//! - [`manager`]: [`Replication`], which reacts to routing table membership
//!   changes and local data insertions, decides who is responsible for each
//!   location key (0-root or n-root) and notifies responsibility listeners.
//! - [`record`]: the location/peer responsibility bookkeeping.
//! - [`auto`]: [`AutoReplication`], a churn predictor that turns observed
//!   departures into a replication factor meeting a reliability target.
//! - [`factor`]: replication factor sources.
//! - [`executor`]: [`ReplicationExecutor`], the default responsibility
//!   listener that moves data through a [`ReplicaSender`].
//! - [`pending`]: completion handles returned by asynchronous notifications.
//! - [`listener`], [`storage`], [`sender`]: boundary traits implemented by
//!   the surrounding node.

pub mod auto;
pub mod executor;
pub mod factor;
pub mod listener;
pub mod manager;
pub mod pending;
pub mod record;
pub mod sender;
pub mod storage;

pub use auto::{AutoReplication, AutoReplicationConfig};
pub use executor::ReplicationExecutor;
pub use factor::{FixedReplicationFactor, ReplicationFactor};
pub use listener::ResponsibilityListener;
pub use manager::{Replication, ReplicationConfig};
pub use pending::{Completer, Pending};
pub use record::ResponsibilityRecord;
pub use sender::ReplicaSender;
pub use storage::StorageAccessor;

/// Default target probability that not every replica departs at once.
pub const DEFAULT_RELIABILITY: f64 = 0.95;

/// Default lower bound of the computed replication factor.
pub const DEFAULT_MIN_FACTOR: usize = 2;

/// Default upper bound of the computed replication factor.
pub const DEFAULT_MAX_FACTOR: usize = 100;

/// Default number of churn observations kept by the predictor.
pub const DEFAULT_OBSERVATION_LENGTH: usize = 10;

/// Error types for replication.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplicationError {
    /// Construction happened outside a tokio runtime.
    #[error("replication requires a running tokio runtime")]
    NoRuntime,

    /// The completing side of a pending result went away without a result.
    #[error("pending result abandoned before completion")]
    Abandoned,

    /// A replica transfer failed.
    #[error("replica send failed: {0}")]
    Send(String),

    /// The supplied configuration violates a construction contract.
    #[error("invalid replication configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;
