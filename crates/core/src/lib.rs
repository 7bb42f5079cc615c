//! Collaborator contracts for the Tessera intake pipeline.
//!
//! The deduplicator and the node wiring talk to the rest of the platform
//! through the traits defined here rather than through concrete types.

mod intake;
mod traits;

pub use intake::{DefaultIntakeEventCounter, NoOpIntakeEventCounter};
pub use traits::{ClearTrigger, IntakeEventCounter};
