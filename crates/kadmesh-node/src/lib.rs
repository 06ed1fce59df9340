//! # kadmesh-node
//!
//! Wires the routing table, the replication manager and the churn predictor
//! into one overlay node, and runs them on a schedule.
//!
//! - [`config`]: TOML configuration with per-section defaults.
//! - [`node::Node`]: one peer and its background services.
//! - [`scheduler::Scheduler`]: owned periodic tasks.
//! - [`storage::MemoryStorage`]: in-memory item store.
//! - [`sim`]: in-process loopback overlay used by the binary and the
//!   integration tests.

pub mod config;
pub mod node;
pub mod scheduler;
pub mod sim;
pub mod storage;
pub mod telemetry;

pub use config::NodeConfig;
pub use node::Node;
pub use scheduler::Scheduler;
pub use sim::{LoopbackNetwork, Simulation, TickReport};
pub use storage::MemoryStorage;

use kadmesh_dht::DhtError;
use kadmesh_replication::ReplicationError;

/// Error types for node assembly.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("routing table: {0}")]
    Dht(#[from] DhtError),

    #[error("replication: {0}")]
    Replication(#[from] ReplicationError),

    /// Services need a tokio runtime to spawn on.
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Convenience result type for node assembly.
pub type Result<T> = std::result::Result<T, NodeError>;
