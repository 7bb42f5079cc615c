//! Collaborator traits used by the intake pipeline.

use tessera_types::NodeId;

/// Tracks how many events from each peer are still inside the intake pipeline.
///
/// Gossip uses this to avoid re-requesting events a peer already sent us.
/// Every component that drops an event (ancient, duplicate, invalid) reports
/// the exit so the count for the sender comes back down.
///
/// Events without a sender (created by this node) are never counted.
pub trait IntakeEventCounter: Send + Sync {
    /// An event from `sender` entered the intake pipeline.
    fn event_entered_intake_pipeline(&self, sender: Option<NodeId>);

    /// An event from `sender` left the intake pipeline.
    fn event_exited_intake_pipeline(&self, sender: Option<NodeId>);

    /// Whether any event from `peer` is still being processed.
    fn has_unprocessed_events(&self, peer: NodeId) -> bool;

    /// Forget all counts (used on reconnect).
    fn reset(&self);
}

/// Reason a stateful intake component is asked to drop everything it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTrigger {
    /// The node is starting from scratch.
    FreshStart,

    /// The node fell behind and is loading a state from a peer.
    Reconnect,
}

impl std::fmt::Display for ClearTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClearTrigger::FreshStart => write!(f, "fresh-start"),
            ClearTrigger::Reconnect => write!(f, "reconnect"),
        }
    }
}
