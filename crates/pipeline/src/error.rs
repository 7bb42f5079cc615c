//! Error types for state roots and the state pipeline.

use std::sync::Arc;
use thiserror::Error;

/// Failures of the durable storage behind a state root.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("storage is corrupt: {0}")]
    Corrupt(String),
}

/// Logic faults detected while merging one copy into the next.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("copy {older} cannot merge into copy {newer}: versions are not adjacent")]
    NotAdjacent { older: u64, newer: u64 },

    #[error("copy {0} must be hashed before merging")]
    NotHashed(u64),

    #[error("copy {0} has already been flushed or merged")]
    AlreadyRetired(u64),
}

/// Errors returned by [`StatePipeline`](crate::StatePipeline).
///
/// `Flush` and `Merge` are fatal: once either occurs the pipeline stops and
/// every later call returns the same error.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("flush of copy {version} failed: {source}")]
    Flush {
        version: u64,
        source: Arc<StorageError>,
    },

    #[error("merge of copy {version} failed: {source}")]
    Merge { version: u64, source: MergeError },

    #[error("detach of copy {version} failed: {source}")]
    Detach {
        version: u64,
        source: Arc<StorageError>,
    },

    #[error("copy {0} is not known to the pipeline")]
    UnknownVersion(u64),

    #[error("copy {0} was merged, not flushed")]
    NotFlushed(u64),

    #[error("state pipeline has terminated")]
    Terminated,
}
