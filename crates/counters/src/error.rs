//! Error types for object counters.

use thiserror::Error;

/// Errors returned by object counters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    /// An interruptable wait was cancelled before it could complete.
    /// The counter is left exactly as it was before the call.
    #[error("wait on counter '{name}' was interrupted")]
    Interrupted { name: String },

    /// A multi-counter was built without any child counters.
    #[error("a multi-counter needs at least one child counter")]
    EmptyMultiCounter,
}
