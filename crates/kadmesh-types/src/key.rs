//! Composite storage keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Id;

/// Identifies one stored item: (location, domain, content).
///
/// Ordering is lexicographic over the triple, so all items of one location
/// form a contiguous range in any ordered map keyed by `CompositeKey`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompositeKey {
    /// Location key; replication responsibility is decided on this part.
    pub location: Id,
    /// Domain key, a namespace within the location.
    pub domain: Id,
    /// Content key within the domain.
    pub content: Id,
}

impl CompositeKey {
    /// Create a composite key.
    pub fn new(location: Id, domain: Id, content: Id) -> Self {
        Self {
            location,
            domain,
            content,
        }
    }

    /// The smallest and largest keys under `location`, both inclusive.
    pub fn location_range(location: Id) -> (CompositeKey, CompositeKey) {
        (
            CompositeKey::new(location, Id::ZERO, Id::ZERO),
            CompositeKey::new(location, Id::MAX, Id::MAX),
        )
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.location, self.domain, self.content)
    }
}
