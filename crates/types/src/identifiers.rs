//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node in the network.
///
/// Used both as the creator of an event and as the peer an event was
/// received from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Consensus round number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Round(pub u64);

impl Round {
    /// Placeholder for "no round has reached consensus yet".
    pub const UNDEFINED: Self = Round(0);

    /// The first round that can reach consensus.
    pub const FIRST: Self = Round(1);

    /// Get the next round.
    pub fn next(self) -> Self {
        Round(self.0 + 1)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Round({})", self.0)
    }
}
