//! Event deduplication for the Tessera intake pipeline.
//!
//! [`EventDeduplicator`] sits right after gossip and drops events that are
//! ancient or have already been seen, reporting each drop to the intake
//! event counter and to [`DedupMetrics`].

mod config;
mod deduplicator;
mod metrics;

pub use config::DedupConfig;
pub use deduplicator::EventDeduplicator;
pub use metrics::DedupMetrics;
