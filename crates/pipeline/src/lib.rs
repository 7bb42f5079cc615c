//! Versioned state copies and the pipeline that retires them.
//!
//! Every round produces a new fast-copy of the state. Older copies become
//! immutable and the [`StatePipeline`] hashes them in version order, then
//! either flushes each one to storage or merges it into the next copy.
//!
//! [`MemoryStateRoot`] is the in-memory implementation of
//! [`VersionedStateRoot`], backed by a [`StateStorage`] such as
//! [`MemoryStorage`] or [`FileStorage`].

mod config;
mod error;
mod memory_root;
mod pipeline;
mod root;
mod storage;

pub use config::{FlushPolicy, PipelineConfig};
pub use error::{MergeError, PipelineError, StorageError};
pub use memory_root::{DetachedSnapshot, MemoryStateRoot};
pub use pipeline::{Retirement, StatePipeline};
pub use root::VersionedStateRoot;
pub use storage::{Change, FileStorage, MemoryStorage, StateStorage};
