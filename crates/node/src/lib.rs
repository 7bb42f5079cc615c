//! Node wiring for Tessera.
//!
//! Assembles the intake and state crates into a running node:
//!
//! - [`NodeConfig`] loads the TOML configuration
//! - [`logging::init`] installs the log subscriber
//! - [`IntakePipeline`] queues gossip events, deduplicates them on a worker
//!   thread and forwards the accepted ones
//! - [`StateManager`] advances state copies round by round
//! - [`Node`] puts them together

mod config;
mod error;
mod intake;
pub mod logging;
mod node;
mod state;

pub use config::{EventConfig, IntakeConfig, LoggingConfig, NodeConfig, StateConfig};
pub use error::{ConfigError, IntakeError, NodeError};
pub use intake::IntakePipeline;
pub use node::Node;
pub use state::StateManager;
