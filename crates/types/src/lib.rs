//! Core types for Tessera event intake.
//!
//! Everything here is an immutable value: hashes, identifiers, event
//! descriptors, gossip events, and the ancient window that decides which
//! events are still relevant to consensus.

mod event;
mod hash;
mod identifiers;
mod signature;
mod window;

pub use event::{EventDescriptor, GossipEvent, GossipEventBuilder, FIRST_GENERATION};
pub use hash::{Hash, HexError};
pub use identifiers::{NodeId, Round};
pub use signature::Signature;
pub use window::{AncientMode, AncientWindow};
