//! Sources of the current replication factor.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Anything that can tell the replication manager how many replicas to keep.
pub trait ReplicationFactor: Send + Sync {
    fn replication_factor(&self) -> usize;
}

/// A factor set by configuration, adjustable at runtime.
#[derive(Debug)]
pub struct FixedReplicationFactor(AtomicUsize);

impl FixedReplicationFactor {
    pub fn new(factor: usize) -> Self {
        Self(AtomicUsize::new(factor))
    }

    pub fn set(&self, factor: usize) {
        self.0.store(factor, Ordering::Release);
    }
}

impl ReplicationFactor for FixedReplicationFactor {
    fn replication_factor(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_factor_is_settable() {
        let factor = FixedReplicationFactor::new(6);
        assert_eq!(factor.replication_factor(), 6);
        factor.set(3);
        assert_eq!(factor.replication_factor(), 3);
    }
}
