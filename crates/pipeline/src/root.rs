//! The contract between the state pipeline and the roots it manages.

use crate::{MergeError, StorageError};
use std::path::Path;
use tessera_types::Hash;

/// One fast-copy of the state, identified by its version.
///
/// A copy is mutable until the next copy is made from it. From then on it is
/// immutable and the [`StatePipeline`](crate::StatePipeline) takes it through
/// hash and then exactly one of flush or merge, strictly in version order.
///
/// Implementations must tolerate being read from other threads while the
/// pipeline works on them. The pipeline never calls `compute_hash`, `flush`
/// or `merge` on the same copy concurrently.
pub trait VersionedStateRoot: Send + Sync + 'static {
    /// Monotonically increasing copy version.
    fn fast_copy_version(&self) -> u64;

    /// Whether a newer copy has been made from this one.
    fn is_immutable(&self) -> bool;

    /// Whether this copy should be flushed rather than merged. Decided once
    /// and stable afterwards.
    fn requested_to_flush(&self) -> bool;

    /// Hash this copy. Called at most once per copy, after the previous
    /// version has been hashed.
    fn compute_hash(&self) -> Hash;

    fn is_hashed(&self) -> bool;

    /// Write this copy to durable storage.
    fn flush(&self) -> Result<(), StorageError>;

    fn is_flushed(&self) -> bool;

    /// Fold this copy's changes into the next newer copy.
    ///
    /// # Panics
    ///
    /// Implementations panic if this copy was requested to flush.
    fn merge(&self, newer: &Self) -> Result<(), MergeError>
    where
        Self: Sized;

    fn is_merged(&self) -> bool;

    /// Write a standalone snapshot of this copy to `destination`.
    fn detach(&self, destination: &Path) -> Result<(), StorageError>;

    fn is_detached(&self) -> bool;

    /// Called on the newest remaining copy when the pipeline shuts down.
    fn on_shutdown(&self, immediately: bool);
}
