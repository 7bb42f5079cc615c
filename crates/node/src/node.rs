//! A node assembled from its configuration.

use crate::{IntakePipeline, NodeConfig, NodeError, StateManager};
use crossbeam::channel::{self, Receiver};
use prometheus::Registry;
use std::sync::Arc;
use tessera_core::{DefaultIntakeEventCounter, IntakeEventCounter};
use tessera_dedup::{DedupMetrics, EventDeduplicator};
use tessera_pipeline::PipelineError;
use tessera_types::{AncientWindow, GossipEvent};
use tracing::info;

/// Event intake and state rounds wired together.
///
/// Accepted events come out of [`events`](Self::events). The consumer reports
/// each one to [`intake_event_counter`](Self::intake_event_counter) once it
/// is done with it.
pub struct Node {
    config: NodeConfig,
    intake: IntakePipeline,
    state: StateManager,
    events: Receiver<GossipEvent>,
    intake_event_counter: Arc<DefaultIntakeEventCounter>,
}

impl Node {
    /// Validate `config`, register metrics in `registry`, open state
    /// storage and start the worker threads.
    pub fn start(config: NodeConfig, registry: &Registry) -> Result<Self, NodeError> {
        config.validate()?;

        let mode = config.event.ancient_mode;
        let dedup_config = config.intake.dedup_config(mode);
        let metrics = DedupMetrics::new(registry, &dedup_config)?;
        let intake_event_counter = Arc::new(DefaultIntakeEventCounter::new());
        let deduplicator = Arc::new(EventDeduplicator::new(
            &dedup_config,
            intake_event_counter.clone(),
            metrics,
        ));

        let state = StateManager::open(&config.state)?;

        let (downstream, events) = channel::unbounded();
        let intake = IntakePipeline::start(
            config.intake.counter(),
            deduplicator,
            intake_event_counter.clone(),
            downstream,
        )?;

        info!(
            ancient_mode = ?mode,
            queue_capacity = config.intake.queue_capacity,
            first_state_version = state.current_version(),
            "Node started"
        );
        Ok(Self {
            config,
            intake,
            state,
            events,
            intake_event_counter,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn intake(&self) -> &IntakePipeline {
        &self.intake
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Events that passed deduplication, in acceptance order.
    pub fn events(&self) -> &Receiver<GossipEvent> {
        &self.events
    }

    pub fn intake_event_counter(&self) -> &dyn IntakeEventCounter {
        &*self.intake_event_counter
    }

    /// Consensus reached a new round: move the ancient window and finish the
    /// state round.
    ///
    /// Returns the version of the state copy the round finished.
    pub fn on_consensus_round(&self, window: AncientWindow) -> Result<u64, PipelineError> {
        self.intake.set_window(window);
        self.state.advance_round()
    }

    /// Stop intake, then the state pipeline.
    pub fn shutdown(&self, immediately: bool) -> Result<(), PipelineError> {
        self.intake.shutdown();
        self.state.shutdown(immediately)
    }
}
