//! Configuration for event deduplication.

use std::time::Duration;
use tessera_types::AncientMode;

/// Configuration for the event deduplicator.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Sequence basis for ancient checks and bucket eviction.
    ///
    /// Fixed for the lifetime of the node.
    pub ancient_mode: AncientMode,

    /// Number of samples after which an old sample's weight in the running
    /// duplicate percentage has halved.
    pub duplicate_average_half_life: f64,

    /// Interval over which the duplicates-per-second rate is measured.
    pub rate_window: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ancient_mode: AncientMode::Generation,
            duplicate_average_half_life: 10.0,
            rate_window: Duration::from_secs(1),
        }
    }
}

impl DedupConfig {
    /// Create a config for the given ancient mode with default metrics settings.
    pub fn for_mode(ancient_mode: AncientMode) -> Self {
        Self {
            ancient_mode,
            ..Default::default()
        }
    }

    /// Set the running-average half life.
    pub fn with_half_life(mut self, samples: f64) -> Self {
        self.duplicate_average_half_life = samples;
        self
    }

    /// Set the rate window.
    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window = window;
        self
    }
}
