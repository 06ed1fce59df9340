//! Integration test crate for the kadmesh overlay.
//!
//! This crate has no library code; it only contains integration tests
//! that drive several nodes over the in-process loopback network.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p kadmesh-integration-tests
//! ```
