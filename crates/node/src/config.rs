//! Node configuration, loaded from TOML.
//!
//! ```toml
//! [event]
//! ancient_mode = "birth_round"
//!
//! [intake]
//! queue_capacity = 4096
//!
//! [state]
//! flush_interval = 10
//! storage_dir = "/var/lib/tessera/state"
//!
//! [logging]
//! filter = "info,tessera_dedup=debug"
//! ```
//!
//! Every section and field is optional and falls back to its default.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tessera_counters::{BackpressureObjectCounter, NoOpCounter, ObjectCounter};
use tessera_dedup::DedupConfig;
use tessera_pipeline::FlushPolicy;
use tessera_types::AncientMode;
use tracing_subscriber::EnvFilter;

/// Complete node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub event: EventConfig,
    pub intake: IntakeConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
}

/// Settings fixed for the node's lifetime that define what an event is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventConfig {
    /// Sequence basis for ancient checks.
    pub ancient_mode: AncientMode,
}

/// Event intake queue and deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntakeConfig {
    /// Events allowed between submission and deduplication. Zero disables
    /// backpressure.
    pub queue_capacity: u64,

    /// Re-check interval of a blocked submitter.
    pub backpressure_sleep_ms: u64,

    /// Samples after which an old sample's weight in the duplicate
    /// percentage has halved.
    pub duplicate_average_half_life: f64,

    /// Window of the duplicates-per-second rate.
    pub rate_window_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            backpressure_sleep_ms: 10,
            duplicate_average_half_life: 10.0,
            rate_window_ms: 1000,
        }
    }
}

impl IntakeConfig {
    /// Deduplicator settings for the given mode.
    pub fn dedup_config(&self, ancient_mode: AncientMode) -> DedupConfig {
        DedupConfig::for_mode(ancient_mode)
            .with_half_life(self.duplicate_average_half_life)
            .with_rate_window(Duration::from_millis(self.rate_window_ms))
    }

    /// Counter bounding the intake queue.
    pub fn counter(&self) -> Arc<dyn ObjectCounter> {
        if self.queue_capacity == 0 {
            return NoOpCounter::instance();
        }
        Arc::new(BackpressureObjectCounter::new(
            "event-intake",
            self.queue_capacity,
            Duration::from_millis(self.backpressure_sleep_ms),
        ))
    }
}

/// State copies and their persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    /// Copies allowed in the pipeline before a new round blocks, counting
    /// the mutable copy. Zero disables backpressure.
    pub max_unretired_copies: u64,

    /// Flush every N-th copy. Zero disables.
    pub flush_interval: u64,

    /// Flush a copy whose own changes cover at least this many keys. Zero
    /// disables.
    pub flush_threshold: usize,

    /// Directory for flushed batches. In-memory storage when absent.
    pub storage_dir: Option<PathBuf>,
}

impl Default for StateConfig {
    fn default() -> Self {
        let policy = FlushPolicy::default();
        Self {
            max_unretired_copies: 32,
            flush_interval: policy.every_n_copies,
            flush_threshold: policy.delta_threshold,
            storage_dir: None,
        }
    }
}

impl StateConfig {
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            every_n_copies: self.flush_interval,
            delta_threshold: self.flush_threshold,
        }
    }

    /// Counter bounding unretired copies.
    pub fn counter(&self) -> Arc<dyn ObjectCounter> {
        if self.max_unretired_copies == 0 {
            return NoOpCounter::instance();
        }
        Arc::new(BackpressureObjectCounter::new(
            "state-copies",
            self.max_unretired_copies,
            Duration::from_millis(1),
        ))
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directives. `RUST_LOG` takes precedence when set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intake = &self.intake;
        if !(intake.duplicate_average_half_life.is_finite()
            && intake.duplicate_average_half_life > 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "intake.duplicate_average_half_life must be positive, got {}",
                intake.duplicate_average_half_life
            )));
        }
        if intake.rate_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "intake.rate_window_ms must be positive".to_string(),
            ));
        }
        if intake.queue_capacity > 0 && intake.backpressure_sleep_ms == 0 {
            return Err(ConfigError::Invalid(
                "intake.backpressure_sleep_ms must be positive when backpressure is enabled"
                    .to_string(),
            ));
        }

        // The mutable copy holds one slot, and a round needs a second one
        // for the copy it creates.
        if self.state.max_unretired_copies == 1 {
            return Err(ConfigError::Invalid(
                "state.max_unretired_copies must be 0 (unbounded) or at least 2".to_string(),
            ));
        }

        EnvFilter::try_new(&self.logging.filter).map_err(|e| {
            ConfigError::Invalid(format!(
                "logging.filter '{}' is not a valid filter: {e}",
                self.logging.filter
            ))
        })?;
        Ok(())
    }

    pub fn with_ancient_mode(mut self, ancient_mode: AncientMode) -> Self {
        self.event.ancient_mode = ancient_mode;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: u64) -> Self {
        self.intake.queue_capacity = queue_capacity;
        self
    }

    pub fn with_max_unretired_copies(mut self, max_unretired_copies: u64) -> Self {
        self.state.max_unretired_copies = max_unretired_copies;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: u64) -> Self {
        self.state.flush_interval = flush_interval;
        self
    }

    pub fn with_storage_dir(mut self, storage_dir: impl Into<PathBuf>) -> Self {
        self.state.storage_dir = Some(storage_dir.into());
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.logging.filter = filter.into();
        self
    }
}
