//! # kadmesh-types
//!
//! Value types shared across the kadmesh workspace.
//!
//! - [`id::Id`]: the 160-bit identifier used both for peers and for location
//!   keys, compared with the Kademlia XOR metric.
//! - [`key::CompositeKey`]: (location, domain, content) triple addressing one
//!   stored item.
//! - [`address::PeerAddress`]: immutable peer record (identifier, endpoint,
//!   reachability flags) together with its wire encoding.
//!
//! All types are pure values without interior mutability.

pub mod address;
pub mod id;
pub mod key;

pub use address::PeerAddress;
pub use id::Id;
pub use key::CompositeKey;

/// Opaque stored payload.
pub type Bytes = Vec<u8>;

/// Error types for value parsing and decoding.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TypesError {
    /// A byte slice did not have the required length.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    /// A hex string could not be parsed into an identifier.
    #[error("invalid hex identifier: {0}")]
    InvalidHex(String),

    /// The buffer ended before a complete peer address was read.
    #[error("truncated peer address: need {needed} bytes, got {got}")]
    TruncatedAddress { needed: usize, got: usize },
}

/// Convenience result type for value parsing.
pub type Result<T> = std::result::Result<T, TypesError>;
