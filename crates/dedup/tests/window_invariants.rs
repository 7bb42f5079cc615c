//! Deduplicator behaviour under randomised traffic and concurrent callers.

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tessera_core::{DefaultIntakeEventCounter, IntakeEventCounter};
use tessera_dedup::{DedupConfig, DedupMetrics, EventDeduplicator};
use tessera_test_helpers::{event, from_peer, signed_event, EventWorkload, RecordingIntakeCounter};
use tessera_types::{AncientMode, AncientWindow, EventDescriptor};

fn deduplicator() -> (EventDeduplicator, Arc<RecordingIntakeCounter>) {
    let counter = Arc::new(RecordingIntakeCounter::new());
    let config = DedupConfig::default();
    let metrics = DedupMetrics::unregistered(&config).unwrap();
    (
        EventDeduplicator::new(&config, counter.clone(), metrics),
        counter,
    )
}

#[derive(Debug, Clone)]
enum Step {
    /// Handle an event with this generation (and a per-step signature choice).
    Handle { generation: u64, creator: u64, alt_signature: bool },
    /// Raise the threshold by this much.
    Advance(u64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0u64..40, 0u64..3, any::<bool>()).prop_map(|(generation, creator, alt_signature)| {
            Step::Handle { generation, creator, alt_signature }
        }),
        1 => (0u64..5).prop_map(Step::Advance),
    ]
}

proptest! {
    /// Accepted in-window events stay remembered until they become ancient,
    /// and each (descriptor, signature) pair is accepted at most once.
    #[test]
    fn prop_window_never_forgets_in_window_events(steps in prop::collection::vec(step(), 1..150)) {
        let (dedup, _) = deduplicator();
        let mut threshold = 0;
        let mut round = 0;
        let mut accepted: HashSet<(EventDescriptor, bool)> = HashSet::new();

        for step in steps {
            match step {
                Step::Handle { generation, creator, alt_signature } => {
                    let e = if alt_signature {
                        signed_event(creator, generation, b"alt")
                    } else {
                        signed_event(creator, generation, b"sig")
                    };
                    let descriptor = e.descriptor;
                    let passed = dedup.handle(e).is_some();

                    let expected = generation >= threshold
                        && !accepted.contains(&(descriptor, alt_signature));
                    prop_assert_eq!(passed, expected);
                    if passed {
                        accepted.insert((descriptor, alt_signature));
                    }
                }
                Step::Advance(delta) => {
                    threshold += delta;
                    round += 1;
                    dedup.set_window(AncientWindow::new(round, threshold, AncientMode::Generation));
                    accepted.retain(|(d, _)| d.generation >= threshold);
                }
            }

            let descriptors: HashSet<_> = accepted.iter().map(|(d, _)| *d).collect();
            prop_assert_eq!(dedup.tracked_descriptors(), descriptors.len());
        }
    }
}

#[test]
fn test_after_window_shift_old_events_are_ancient_even_if_unseen() {
    let (dedup, counter) = deduplicator();
    dedup.set_window(AncientWindow::new(10, 20, AncientMode::Generation));

    for generation in 0..20 {
        assert!(dedup.handle(from_peer(event(9, generation), 1)).is_none());
    }
    assert_eq!(counter.exits(1), 20);
    assert_eq!(dedup.tracked_descriptors(), 0);
}

#[test]
fn test_concurrent_handlers_accept_each_event_once() {
    let intake = Arc::new(DefaultIntakeEventCounter::new());
    let config = DedupConfig::default();
    let dedup = Arc::new(EventDeduplicator::new(
        &config,
        intake.clone(),
        DedupMetrics::unregistered(&config).unwrap(),
    ));

    let mut workload = EventWorkload::new(11, 5);
    let events: Vec<_> = (0..300).map(|_| workload.next_event()).collect();
    let distinct = workload.originals().len();

    // Every thread delivers the full stream, like redundant gossip peers.
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let dedup = Arc::clone(&dedup);
            let intake = Arc::clone(&intake);
            let events = events.clone();
            thread::spawn(move || {
                let mut passed = 0;
                for e in events {
                    intake.event_entered_intake_pipeline(e.sender_id);
                    if dedup.handle(e.clone()).is_some() {
                        intake.event_exited_intake_pipeline(e.sender_id);
                        passed += 1;
                    }
                }
                passed
            })
        })
        .collect();

    let passed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(passed, distinct);
    assert_eq!(dedup.tracked_descriptors(), distinct);
}

#[test]
fn test_window_shift_races_with_handlers() {
    let (dedup, _) = deduplicator();
    let dedup = Arc::new(dedup);

    let shifter = {
        let dedup = Arc::clone(&dedup);
        thread::spawn(move || {
            for threshold in 1..=50 {
                dedup.set_window(AncientWindow::new(threshold, threshold, AncientMode::Generation));
            }
        })
    };

    let handlers: Vec<_> = (0..3)
        .map(|creator| {
            let dedup = Arc::clone(&dedup);
            thread::spawn(move || {
                for generation in 0..100 {
                    dedup.handle(event(creator, generation));
                }
            })
        })
        .collect();

    shifter.join().unwrap();
    for handler in handlers {
        handler.join().unwrap();
    }

    // Nothing below the final threshold survives.
    let threshold = dedup.window().ancient_threshold();
    assert_eq!(threshold, 50);
    for creator in 0..3 {
        for generation in 0..threshold {
            assert_eq!(dedup.signature_count(&event(creator, generation).descriptor), 0);
        }
    }
}
