//! Event deduplicator.

use crate::{DedupConfig, DedupMetrics};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tessera_core::{ClearTrigger, IntakeEventCounter};
use tessera_sequence::SequenceWindowMap;
use tessera_types::{AncientMode, AncientWindow, EventDescriptor, GossipEvent, Signature};
use tracing::{debug, info, warn};

/// Signatures seen for each non-ancient descriptor.
type ObservedEvents =
    SequenceWindowMap<EventDescriptor, Mutex<HashSet<Signature>>, fn(&EventDescriptor) -> u64>;

/// Bucket capacity reserved up front.
const INITIAL_CAPACITY: usize = 1024;

/// Result of recording a signature against a descriptor's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    /// First signature for this descriptor.
    Novel,
    /// New signature for a descriptor that already had one.
    DisparateSignature,
    /// Descriptor and signature both seen before.
    Duplicate,
}

fn observe(signatures: &mut HashSet<Signature>, signature: &Signature) -> Observation {
    if !signatures.insert(signature.clone()) {
        Observation::Duplicate
    } else if signatures.len() == 1 {
        Observation::Novel
    } else {
        Observation::DisparateSignature
    }
}

/// Drops ancient and duplicate gossip events.
///
/// Remembers every signature seen for every non-ancient descriptor. An event
/// passes if its descriptor is new, or if the descriptor is known but the
/// signature is not (the latter is counted as an anomaly but still passed on,
/// since only one of the competing events can be valid and this stage cannot
/// tell which).
///
/// Memory is bounded by the ancient window: [`set_window`](Self::set_window)
/// evicts every bucket whose descriptor became ancient, and nothing else
/// ever evicts a bucket.
///
/// # Concurrency
///
/// `handle` may be called from many threads at once. The window is swapped
/// atomically, so readers see either the old or the new window. Existing
/// buckets are found under a shared lock and locked individually, so events
/// with different descriptors proceed in parallel while the signature insert
/// for one descriptor is serialized. Creating a bucket, shifting the window
/// and clearing take the exclusive lock.
pub struct EventDeduplicator {
    mode: AncientMode,
    window: ArcSwap<AncientWindow>,
    observed: RwLock<ObservedEvents>,
    intake_event_counter: Arc<dyn IntakeEventCounter>,
    metrics: DedupMetrics,
}

impl EventDeduplicator {
    pub fn new(
        config: &DedupConfig,
        intake_event_counter: Arc<dyn IntakeEventCounter>,
        metrics: DedupMetrics,
    ) -> Self {
        let mode = config.ancient_mode;
        Self {
            mode,
            window: ArcSwap::from_pointee(AncientWindow::genesis(mode)),
            observed: RwLock::new(Self::empty_map(mode)),
            intake_event_counter,
            metrics,
        }
    }

    fn empty_map(mode: AncientMode) -> ObservedEvents {
        SequenceWindowMap::with_capacity(0, INITIAL_CAPACITY, mode.extractor())
    }

    /// Pass `event` on if it is neither ancient nor a duplicate.
    ///
    /// Dropped events are reported to the intake event counter as having
    /// left the pipeline.
    pub fn handle(&self, event: GossipEvent) -> Option<GossipEvent> {
        if self.window.load().is_ancient(&event.descriptor) {
            return self.drop_ancient(event);
        }

        let existing = {
            let observed = self.observed.read();
            observed
                .get(&event.descriptor)
                .map(|bucket| observe(&mut bucket.lock(), &event.signature))
        };

        let observation = match existing {
            Some(observation) => Some(observation),
            None => self
                .observed
                .write()
                .compute_if_absent(event.descriptor, |_| Mutex::default())
                .map(|bucket| observe(bucket.get_mut(), &event.signature)),
        };

        // No bucket means the window moved past this event after the check.
        let Some(observation) = observation else {
            return self.drop_ancient(event);
        };

        match observation {
            Observation::Novel => {
                self.metrics.record_novel();
                Some(event)
            }
            Observation::DisparateSignature => {
                warn!(
                    creator = %event.descriptor.creator,
                    generation = event.descriptor.generation,
                    birth_round = event.descriptor.birth_round,
                    hash = %event.descriptor.hash,
                    sender = ?event.sender_id,
                    "Event with known descriptor but disparate signature"
                );
                self.metrics.record_disparate_signature();
                self.metrics.record_novel();
                Some(event)
            }
            Observation::Duplicate => {
                self.metrics.record_duplicate();
                self.intake_event_counter
                    .event_exited_intake_pipeline(event.sender_id);
                None
            }
        }
    }

    fn drop_ancient(&self, event: GossipEvent) -> Option<GossipEvent> {
        self.metrics.record_ancient();
        self.intake_event_counter
            .event_exited_intake_pipeline(event.sender_id);
        None
    }

    /// Install a new ancient window and evict every bucket that became
    /// ancient.
    ///
    /// # Panics
    ///
    /// Panics if the window uses a different ancient mode or has a lower
    /// threshold than the current one.
    pub fn set_window(&self, window: AncientWindow) {
        assert_eq!(
            window.mode(),
            self.mode,
            "ancient mode is fixed for the lifetime of the deduplicator"
        );

        let mut observed = self.observed.write();
        let previous = self.window.load_full();
        assert!(
            window.ancient_threshold() >= previous.ancient_threshold(),
            "ancient threshold must not decrease: {} -> {}",
            previous.ancient_threshold(),
            window.ancient_threshold()
        );

        self.window.store(Arc::new(window));
        let evicted = observed.shift_window(window.ancient_threshold());

        debug!(
            old_threshold = previous.ancient_threshold(),
            new_threshold = window.ancient_threshold(),
            latest_round = window.latest_consensus_round(),
            evicted,
            remaining = observed.len(),
            "Shifted deduplication window"
        );
    }

    /// Forget every observed event and return to the genesis window.
    pub fn clear(&self, trigger: ClearTrigger) {
        let mut observed = self.observed.write();
        let dropped = observed.len();
        *observed = Self::empty_map(self.mode);
        self.window.store(Arc::new(AncientWindow::genesis(self.mode)));
        info!(%trigger, dropped, "Cleared event deduplicator");
    }

    /// The active ancient window.
    pub fn window(&self) -> Arc<AncientWindow> {
        self.window.load_full()
    }

    /// Number of descriptors currently remembered.
    pub fn tracked_descriptors(&self) -> usize {
        self.observed.read().len()
    }

    /// Number of distinct signatures remembered for `descriptor`.
    pub fn signature_count(&self, descriptor: &EventDescriptor) -> usize {
        self.observed
            .read()
            .get(descriptor)
            .map_or(0, |bucket| bucket.lock().len())
    }

    pub fn metrics(&self) -> &DedupMetrics {
        &self.metrics
    }
}

impl std::fmt::Debug for EventDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDeduplicator")
            .field("window", &*self.window.load())
            .field("tracked_descriptors", &self.tracked_descriptors())
            .finish()
    }
}
