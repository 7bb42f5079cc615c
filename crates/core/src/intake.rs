//! Intake event counter implementations.

use crate::IntakeEventCounter;
use dashmap::DashMap;
use tessera_types::NodeId;
use tracing::debug;

/// Per-peer intake counts backed by a concurrent map.
///
/// Entered and exited notifications come from different threads (gossip
/// threads enter, intake stages exit), so counts live in a [`DashMap`].
#[derive(Debug, Default)]
pub struct DefaultIntakeEventCounter {
    counts: DashMap<NodeId, usize>,
}

impl DefaultIntakeEventCounter {
    /// Create an empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events from `peer` currently in the pipeline.
    pub fn unprocessed_events(&self, peer: NodeId) -> usize {
        self.counts.get(&peer).map_or(0, |count| *count)
    }
}

impl IntakeEventCounter for DefaultIntakeEventCounter {
    fn event_entered_intake_pipeline(&self, sender: Option<NodeId>) {
        let Some(sender) = sender else {
            return;
        };
        *self.counts.entry(sender).or_insert(0) += 1;
    }

    /// # Panics
    ///
    /// Panics if `sender` has no event in the pipeline. Exits must pair
    /// with entries.
    fn event_exited_intake_pipeline(&self, sender: Option<NodeId>) {
        let Some(sender) = sender else {
            return;
        };
        let mut count = self.counts.entry(sender).or_insert(0);
        assert!(
            *count > 0,
            "event from {} exited the intake pipeline without entering it",
            sender
        );
        *count -= 1;
    }

    fn has_unprocessed_events(&self, peer: NodeId) -> bool {
        self.unprocessed_events(peer) > 0
    }

    fn reset(&self) {
        debug!(peers = self.counts.len(), "Resetting intake event counts");
        self.counts.clear();
    }
}

/// Intake counter that tracks nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpIntakeEventCounter;

impl IntakeEventCounter for NoOpIntakeEventCounter {
    fn event_entered_intake_pipeline(&self, _sender: Option<NodeId>) {}

    fn event_exited_intake_pipeline(&self, _sender: Option<NodeId>) {}

    fn has_unprocessed_events(&self, _peer: NodeId) -> bool {
        false
    }

    fn reset(&self) {}
}
