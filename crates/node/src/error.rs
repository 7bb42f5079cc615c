//! Error types for node wiring.

use std::path::PathBuf;
use tessera_counters::CounterError;
use tessera_pipeline::StorageError;
use tessera_types::GossipEvent;
use thiserror::Error;

/// Errors loading or validating a [`NodeConfig`](crate::NodeConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file is not valid TOML or has unknown fields.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The values parse but make no sense together.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors submitting events to the [`IntakePipeline`](crate::IntakePipeline).
#[derive(Debug, Error)]
pub enum IntakeError {
    /// The queue is at capacity. The event is handed back.
    #[error("Intake queue is full")]
    Full(Box<GossipEvent>),

    /// Waiting for queue capacity was cancelled.
    #[error(transparent)]
    Interrupted(#[from] CounterError),

    /// The pipeline has shut down.
    #[error("Intake pipeline is shut down")]
    Closed,

    /// The intake worker thread could not be started.
    #[error("Failed to start intake worker: {0}")]
    Spawn(std::io::Error),
}

/// Errors starting a [`Node`](crate::Node).
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open state storage: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Intake(#[from] IntakeError),
}
