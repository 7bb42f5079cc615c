//! Sliding-window containers for sequence-numbered keys.
//!
//! Consensus events carry a monotonic sequence value (generation or birth
//! round). State that is only relevant while an event is non-ancient can be
//! kept in a [`SequenceWindowMap`] and evicted in bulk when the window moves.

mod map;

pub use map::SequenceWindowMap;
