//! Test fixtures shared across Tessera crates.
//!
//! Events built here have real descriptor hashes (through
//! [`GossipEventBuilder`]) but placeholder signatures; nothing in the
//! intake path verifies signatures.

use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use tessera_core::IntakeEventCounter;
use tessera_types::{EventDescriptor, GossipEvent, GossipEventBuilder, NodeId, Signature};

/// An event from `creator` at `generation`, signed `b"sig"`, with no sender.
pub fn event(creator: u64, generation: u64) -> GossipEvent {
    signed_event(creator, generation, b"sig")
}

/// An event from `creator` at `generation` with the given signature.
pub fn signed_event(creator: u64, generation: u64, signature: &'static [u8]) -> GossipEvent {
    GossipEventBuilder::new(NodeId(creator))
        .generation(generation)
        .signature(signature)
        .build()
}

/// An event from `creator` with the given birth round.
pub fn event_in_round(creator: u64, birth_round: u64) -> GossipEvent {
    GossipEventBuilder::new(NodeId(creator))
        .birth_round(birth_round)
        .signature(&b"sig"[..])
        .build()
}

/// The same event as if gossiped to us by `peer`.
pub fn from_peer(event: GossipEvent, peer: u64) -> GossipEvent {
    event.with_sender(Some(NodeId(peer)))
}

/// Intake counter that records every notification and never panics.
///
/// Lets tests assert exactly which senders the component under test
/// reported as exited.
#[derive(Debug, Default)]
pub struct RecordingIntakeCounter {
    entered: DashMap<NodeId, usize>,
    exited: DashMap<NodeId, usize>,
}

impl RecordingIntakeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exits reported for `peer`.
    pub fn exits(&self, peer: u64) -> usize {
        self.exited.get(&NodeId(peer)).map_or(0, |n| *n)
    }

    /// Exits reported across all peers.
    pub fn total_exits(&self) -> usize {
        self.exited.iter().map(|entry| *entry.value()).sum()
    }

    /// Entries reported for `peer`.
    pub fn entries(&self, peer: u64) -> usize {
        self.entered.get(&NodeId(peer)).map_or(0, |n| *n)
    }
}

impl IntakeEventCounter for RecordingIntakeCounter {
    fn event_entered_intake_pipeline(&self, sender: Option<NodeId>) {
        if let Some(sender) = sender {
            *self.entered.entry(sender).or_insert(0) += 1;
        }
    }

    fn event_exited_intake_pipeline(&self, sender: Option<NodeId>) {
        if let Some(sender) = sender {
            *self.exited.entry(sender).or_insert(0) += 1;
        }
    }

    fn has_unprocessed_events(&self, peer: NodeId) -> bool {
        let entered = self.entered.get(&peer).map_or(0, |n| *n);
        let exited = self.exited.get(&peer).map_or(0, |n| *n);
        entered > exited
    }

    fn reset(&self) {
        self.entered.clear();
        self.exited.clear();
    }
}

/// Generates a reproducible stream of gossip traffic.
///
/// Creators extend their own chains, so generations grow over time. A
/// configurable fraction of emitted events are replays of earlier ones, the
/// way redundant gossip delivers the same event through several peers.
pub struct EventWorkload {
    rng: ChaCha8Rng,

    /// Number of creators (and peers) in the simulated network.
    nodes: u64,

    /// Probability that the next event is a replay (0.0 to 1.0).
    duplicate_ratio: f64,

    /// Latest event per creator.
    tips: HashMap<u64, EventDescriptor>,

    /// Everything emitted so far that was not a replay.
    emitted: Vec<GossipEvent>,
}

impl EventWorkload {
    pub fn new(seed: u64, nodes: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            nodes: nodes.max(1),
            duplicate_ratio: 0.0,
            tips: HashMap::new(),
            emitted: Vec::new(),
        }
    }

    /// Set the replay probability.
    pub fn with_duplicate_ratio(mut self, ratio: f64) -> Self {
        self.duplicate_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Distinct events emitted so far.
    pub fn originals(&self) -> &[GossipEvent] {
        &self.emitted
    }

    /// Next event, arriving from a random peer.
    pub fn next_event(&mut self) -> GossipEvent {
        let peer = self.rng.gen_range(0..self.nodes);

        if !self.emitted.is_empty() && self.rng.gen_bool(self.duplicate_ratio) {
            let index = self.rng.gen_range(0..self.emitted.len());
            return from_peer(self.emitted[index].clone(), peer);
        }

        let creator = self.rng.gen_range(0..self.nodes);
        let mut builder = GossipEventBuilder::new(NodeId(creator));
        if let Some(tip) = self.tips.get(&creator) {
            builder = builder.self_parent(*tip);
        }
        if let Some(other) = self.pick_other_parent(creator) {
            builder = builder.other_parent(other);
        }

        let signature: [u8; 16] = self.rng.gen();
        let payload: [u8; 32] = self.rng.gen();
        let event = builder
            .signature(Signature::new(signature.to_vec()))
            .payload(payload.to_vec())
            .build();

        self.tips.insert(creator, event.descriptor);
        self.emitted.push(event.clone());
        from_peer(event, peer)
    }

    fn pick_other_parent(&mut self, creator: u64) -> Option<EventDescriptor> {
        let other = self.rng.gen_range(0..self.nodes);
        if other == creator {
            return None;
        }
        self.tips.get(&other).copied()
    }
}
