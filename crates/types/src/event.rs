//! Gossip events and their descriptors.

use crate::{Hash, NodeId, Signature};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Generation of an event with no parents.
pub const FIRST_GENERATION: u64 = 0;

/// Identifies a gossip event independently of its signature.
///
/// Two events with equal descriptors claim to be the same event. If their
/// signatures differ, at most one of them is genuine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// Hash of the event's hashed content.
    pub hash: Hash,

    /// Node that created the event.
    pub creator: NodeId,

    /// One more than the highest parent generation.
    pub generation: u64,

    /// Round the creator assigned to the event when it was created.
    pub birth_round: u64,
}

impl EventDescriptor {
    /// Create a new descriptor.
    pub fn new(hash: Hash, creator: NodeId, generation: u64, birth_round: u64) -> Self {
        Self {
            hash,
            creator,
            generation,
            birth_round,
        }
    }

    /// Sequence extractor for generation-based ancient modes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Sequence extractor for birth-round-based ancient modes.
    pub fn birth_round(&self) -> u64 {
        self.birth_round
    }
}

/// An event as received from gossip.
///
/// Created by the gossip layer, consumed but never mutated by intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipEvent {
    /// Identity of the event.
    pub descriptor: EventDescriptor,

    /// The creator's previous event, if any.
    pub self_parent: Option<EventDescriptor>,

    /// Another creator's event, if any.
    pub other_parent: Option<EventDescriptor>,

    /// Application payload (covered by the descriptor hash).
    pub payload: Bytes,

    /// Creator's signature over the descriptor hash (not hashed).
    pub signature: Signature,

    /// Peer this event was received from. `None` for self-created events.
    pub sender_id: Option<NodeId>,
}

impl GossipEvent {
    /// The event's descriptor.
    pub fn descriptor(&self) -> &EventDescriptor {
        &self.descriptor
    }

    /// The event's signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Peer that delivered this event.
    pub fn sender_id(&self) -> Option<NodeId> {
        self.sender_id
    }

    /// Iterate over the zero, one, or two parent descriptors.
    pub fn parents(&self) -> impl Iterator<Item = &EventDescriptor> {
        self.self_parent.iter().chain(self.other_parent.iter())
    }

    /// Same event delivered by a different peer.
    pub fn with_sender(mut self, sender: Option<NodeId>) -> Self {
        self.sender_id = sender;
        self
    }

    /// Same descriptor with a different signature.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }
}

/// Builds a [`GossipEvent`], deriving the generation and descriptor hash.
///
/// # Example
///
/// ```
/// use tessera_types::{GossipEventBuilder, NodeId};
///
/// let genesis = GossipEventBuilder::new(NodeId(1)).signature(&b"sig"[..]).build();
/// let child = GossipEventBuilder::new(NodeId(1))
///     .self_parent(genesis.descriptor)
///     .signature(&b"sig"[..])
///     .build();
/// assert_eq!(child.descriptor.generation, genesis.descriptor.generation + 1);
/// ```
#[derive(Debug, Clone)]
pub struct GossipEventBuilder {
    creator: NodeId,
    self_parent: Option<EventDescriptor>,
    other_parent: Option<EventDescriptor>,
    generation: Option<u64>,
    birth_round: u64,
    payload: Bytes,
    signature: Signature,
    sender_id: Option<NodeId>,
}

impl GossipEventBuilder {
    /// Start building an event created by `creator`.
    pub fn new(creator: NodeId) -> Self {
        Self {
            creator,
            self_parent: None,
            other_parent: None,
            generation: None,
            birth_round: crate::Round::FIRST.0,
            payload: Bytes::new(),
            signature: Signature::new(Bytes::new()),
            sender_id: None,
        }
    }

    /// Set the self parent.
    pub fn self_parent(mut self, parent: EventDescriptor) -> Self {
        self.self_parent = Some(parent);
        self
    }

    /// Set the other parent.
    pub fn other_parent(mut self, parent: EventDescriptor) -> Self {
        self.other_parent = Some(parent);
        self
    }

    /// Override the generation instead of deriving it from the parents.
    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Set the birth round.
    pub fn birth_round(mut self, birth_round: u64) -> Self {
        self.birth_round = birth_round;
        self
    }

    /// Set the payload.
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the signature.
    pub fn signature(mut self, signature: impl Into<Signature>) -> Self {
        self.signature = signature.into();
        self
    }

    /// Set the peer the event arrives from.
    pub fn sender(mut self, sender: NodeId) -> Self {
        self.sender_id = Some(sender);
        self
    }

    /// Finish the event.
    pub fn build(self) -> GossipEvent {
        let generation = self.generation.unwrap_or_else(|| {
            self.self_parent
                .iter()
                .chain(self.other_parent.iter())
                .map(|p| p.generation + 1)
                .max()
                .unwrap_or(FIRST_GENERATION)
        });

        let self_parent_hash = self.self_parent.map_or(Hash::ZERO, |p| p.hash);
        let other_parent_hash = self.other_parent.map_or(Hash::ZERO, |p| p.hash);
        let creator = self.creator.0.to_le_bytes();
        let generation_bytes = generation.to_le_bytes();
        let birth_round = self.birth_round.to_le_bytes();
        let hash = Hash::from_parts(&[
            &creator[..],
            &generation_bytes[..],
            &birth_round[..],
            &self_parent_hash.as_bytes()[..],
            &other_parent_hash.as_bytes()[..],
            &self.payload[..],
        ]);

        GossipEvent {
            descriptor: EventDescriptor::new(hash, self.creator, generation, self.birth_round),
            self_parent: self.self_parent,
            other_parent: self.other_parent,
            payload: self.payload,
            signature: self.signature,
            sender_id: self.sender_id,
        }
    }
}
