//! Configuration for the state pipeline and the in-memory root.

use std::sync::Arc;
use tessera_counters::{NoOpCounter, ObjectCounter};

/// Configuration for a [`StatePipeline`](crate::StatePipeline).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name of the worker thread and of the pipeline in logs.
    pub name: String,

    /// Counter on-ramped for every registered copy and off-ramped when the
    /// copy is flushed or merged.
    ///
    /// A bounded counter makes `register_copy` block while too many copies
    /// are waiting to retire.
    pub counter: Arc<dyn ObjectCounter>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "state-pipeline".to_string(),
            counter: NoOpCounter::instance(),
        }
    }
}

impl PipelineConfig {
    /// Set the backpressure counter.
    pub fn with_counter(mut self, counter: Arc<dyn ObjectCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Set the pipeline name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Decides, when a copy becomes immutable, whether it will be flushed.
///
/// A copy is flushed if any enabled rule matches. Zero disables a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush every copy whose version is a multiple of this.
    pub every_n_copies: u64,

    /// Flush a copy whose own changes hold at least this many keys.
    pub delta_threshold: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            every_n_copies: 20,
            delta_threshold: 10_000,
        }
    }
}

impl FlushPolicy {
    /// Never flush automatically.
    pub fn never() -> Self {
        Self {
            every_n_copies: 0,
            delta_threshold: 0,
        }
    }

    /// Flush every `n`-th copy.
    pub fn every(n: u64) -> Self {
        Self {
            every_n_copies: n,
            delta_threshold: 0,
        }
    }

    pub(crate) fn should_flush(&self, version: u64, delta_len: usize) -> bool {
        let periodic = self.every_n_copies > 0 && version % self.every_n_copies == 0;
        let oversized = self.delta_threshold > 0 && delta_len >= self.delta_threshold;
        periodic || oversized
    }
}
