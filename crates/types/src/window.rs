//! Ancient-event windows.
//!
//! An event is *ancient* once its sequence value (generation or birth round,
//! depending on [`AncientMode`]) falls below the current ancient threshold.
//! Ancient events can no longer influence consensus and are dropped at
//! intake. The threshold only ever moves forward.

use crate::{EventDescriptor, Round, FIRST_GENERATION};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which sequence value decides whether an event is ancient.
///
/// Selected once at startup and fixed for the node's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AncientMode {
    /// Events are ancient by generation.
    #[default]
    Generation,

    /// Events are ancient by birth round.
    BirthRound,
}

impl AncientMode {
    /// The sequence value of `descriptor` under this mode.
    pub fn sequence_of(self, descriptor: &EventDescriptor) -> u64 {
        (self.extractor())(descriptor)
    }

    /// Key function for window maps keyed by descriptor.
    pub fn extractor(self) -> fn(&EventDescriptor) -> u64 {
        match self {
            AncientMode::Generation => EventDescriptor::generation,
            AncientMode::BirthRound => EventDescriptor::birth_round,
        }
    }

    /// Lowest threshold a window may have in this mode.
    pub fn genesis_threshold(self) -> u64 {
        match self {
            AncientMode::Generation => FIRST_GENERATION,
            AncientMode::BirthRound => Round::FIRST.0,
        }
    }
}

/// Immutable snapshot of the non-ancient window.
///
/// Replaced wholesale whenever consensus advances; never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncientWindow {
    latest_consensus_round: u64,
    ancient_threshold: u64,
    mode: AncientMode,
}

impl AncientWindow {
    /// Create a window.
    pub fn new(latest_consensus_round: u64, ancient_threshold: u64, mode: AncientMode) -> Self {
        Self {
            latest_consensus_round,
            ancient_threshold,
            mode,
        }
    }

    /// The window in effect before any round reaches consensus.
    pub fn genesis(mode: AncientMode) -> Self {
        Self::new(Round::UNDEFINED.0, mode.genesis_threshold(), mode)
    }

    /// Latest round to have reached consensus.
    pub fn latest_consensus_round(&self) -> u64 {
        self.latest_consensus_round
    }

    /// Lowest non-ancient sequence value.
    pub fn ancient_threshold(&self) -> u64 {
        self.ancient_threshold
    }

    /// The mode this window was built for.
    pub fn mode(&self) -> AncientMode {
        self.mode
    }

    /// Whether a raw sequence value is ancient.
    pub fn is_ancient_value(&self, sequence_value: u64) -> bool {
        sequence_value < self.ancient_threshold
    }

    /// Whether the event with this descriptor is ancient.
    pub fn is_ancient(&self, descriptor: &EventDescriptor) -> bool {
        self.is_ancient_value(self.mode.sequence_of(descriptor))
    }

    /// Window with a higher threshold and the same latest round.
    ///
    /// # Panics
    ///
    /// Panics if `new_threshold` is lower than the current threshold.
    pub fn advance(&self, new_threshold: u64) -> Self {
        self.advance_to(self.latest_consensus_round, new_threshold)
    }

    /// Window for a newly decided round.
    ///
    /// # Panics
    ///
    /// Panics if either the round or the threshold would move backwards.
    pub fn advance_to(&self, latest_consensus_round: u64, new_threshold: u64) -> Self {
        assert!(
            new_threshold >= self.ancient_threshold,
            "ancient threshold must not decrease: {} -> {}",
            self.ancient_threshold,
            new_threshold
        );
        assert!(
            latest_consensus_round >= self.latest_consensus_round,
            "consensus round must not decrease: {} -> {}",
            self.latest_consensus_round,
            latest_consensus_round
        );
        Self::new(latest_consensus_round, new_threshold, self.mode)
    }
}

impl fmt::Display for AncientWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AncientWindow(round={}, threshold={}, mode={:?})",
            self.latest_consensus_round, self.ancient_threshold, self.mode
        )
    }
}
