//! Intake pipeline wired to a real deduplicator and bounded queue.

use crossbeam::channel::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::IntakeEventCounter;
use tessera_counters::{BackpressureObjectCounter, ObjectCounter, StandardObjectCounter};
use tessera_dedup::{DedupConfig, DedupMetrics, EventDeduplicator};
use tessera_node::{IntakeError, IntakePipeline};
use tessera_test_helpers::{event, from_peer, EventWorkload, RecordingIntakeCounter};
use tessera_types::{AncientMode, AncientWindow, GossipEvent};
use tokio_util::sync::CancellationToken;

struct Harness {
    intake: IntakePipeline,
    accepted: Receiver<GossipEvent>,
    recorder: Arc<RecordingIntakeCounter>,
}

fn harness(counter: Arc<dyn ObjectCounter>, downstream_capacity: Option<usize>) -> Harness {
    let recorder = Arc::new(RecordingIntakeCounter::new());
    let config = DedupConfig::default();
    let deduplicator = Arc::new(EventDeduplicator::new(
        &config,
        recorder.clone(),
        DedupMetrics::unregistered(&config).unwrap(),
    ));
    let (downstream, accepted) = match downstream_capacity {
        Some(capacity) => channel::bounded(capacity),
        None => channel::unbounded(),
    };
    let intake = IntakePipeline::start(counter, deduplicator, recorder.clone(), downstream).unwrap();
    Harness {
        intake,
        accepted,
        recorder,
    }
}

fn bounded(capacity: u64) -> Arc<dyn ObjectCounter> {
    Arc::new(BackpressureObjectCounter::new(
        "test-intake",
        capacity,
        Duration::from_millis(1),
    ))
}

#[test]
fn test_redundant_gossip_is_forwarded_once() {
    let h = harness(bounded(16), None);
    let mut workload = EventWorkload::new(7, 4).with_duplicate_ratio(0.4);

    let mut submitted = 0;
    for _ in 0..500 {
        h.intake.submit(workload.next_event()).unwrap();
        submitted += 1;
    }
    h.intake.drain();

    let accepted: Vec<_> = h.accepted.try_iter().collect();
    assert_eq!(accepted.len(), workload.originals().len());
    assert_eq!(h.intake.queued(), 0);

    // Duplicates were reported as exited by the deduplicator; the rest are
    // ours to report.
    assert_eq!(h.recorder.total_exits(), submitted - accepted.len());
    for e in &accepted {
        h.recorder.event_exited_intake_pipeline(e.sender_id);
    }
    for peer in 0..4 {
        assert_eq!(h.recorder.entries(peer), h.recorder.exits(peer));
    }
    assert!(h.intake.deduplicator().metrics().duplicate_percent() > 0.0);
}

#[test]
fn test_full_queue_rejects_try_submit_and_blocks_submit() {
    // A rendezvous downstream holds the worker on the first event.
    let counter = bounded(2);
    let h = harness(counter.clone(), Some(0));

    h.intake.submit(from_peer(event(1, 0), 9)).unwrap();
    h.intake.submit(from_peer(event(1, 1), 9)).unwrap();

    let rejected = from_peer(event(1, 2), 9);
    match h.intake.try_submit(rejected.clone()) {
        Err(IntakeError::Full(returned)) => assert_eq!(*returned, rejected),
        other => panic!("expected a full queue, got {other:?}"),
    }
    assert_eq!(h.recorder.entries(9), 2);

    // Receiving lets the worker off-ramp the first event.
    assert_eq!(h.accepted.recv().unwrap().descriptor.generation, 0);
    h.intake.submit(rejected).unwrap();
    assert_eq!(counter.count(), 2);

    assert_eq!(h.accepted.recv().unwrap().descriptor.generation, 1);
    assert_eq!(h.accepted.recv().unwrap().descriptor.generation, 2);
    h.intake.drain();
    assert_eq!(counter.count(), 0);
}

#[test]
fn test_cancelled_submission_leaves_no_trace() {
    let counter = bounded(1);
    let h = harness(counter.clone(), Some(0));
    h.intake.submit(from_peer(event(1, 0), 3)).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = h
        .intake
        .submit_interruptable(from_peer(event(1, 1), 3), &cancel);

    assert!(matches!(result, Err(IntakeError::Interrupted(_))));
    assert_eq!(counter.count(), 1);
    assert_eq!(h.recorder.entries(3), 1);
    assert_eq!(h.accepted.recv().unwrap().descriptor.generation, 0);
}

#[test]
fn test_window_shift_drops_ancient_events() {
    let h = harness(Arc::new(StandardObjectCounter::new("test-intake")), None);
    h.intake
        .set_window(AncientWindow::new(3, 5, AncientMode::Generation));

    for generation in 0..10 {
        h.intake.submit(from_peer(event(2, generation), 4)).unwrap();
    }
    h.intake.drain();

    let generations: Vec<u64> = h
        .accepted
        .try_iter()
        .map(|e| e.descriptor.generation)
        .collect();
    assert_eq!(generations, vec![5, 6, 7, 8, 9]);
    assert_eq!(h.recorder.exits(4), 5);
}

#[test]
fn test_submit_after_shutdown_is_refused() {
    let counter = bounded(4);
    let h = harness(counter.clone(), None);
    h.intake.submit(from_peer(event(1, 0), 5)).unwrap();
    h.intake.shutdown();

    // Events queued before shutdown were still processed.
    assert_eq!(h.accepted.try_iter().count(), 1);

    assert!(matches!(
        h.intake.submit(from_peer(event(1, 1), 5)),
        Err(IntakeError::Closed)
    ));
    assert_eq!(counter.count(), 0);
    assert_eq!(h.recorder.entries(5), 2);
    assert_eq!(h.recorder.exits(5), 1);
}

#[test]
fn test_closed_downstream_reports_exits() {
    let h = harness(bounded(4), None);
    drop(h.accepted);

    h.intake.submit(from_peer(event(1, 0), 6)).unwrap();
    h.intake.submit(from_peer(event(1, 1), 6)).unwrap();
    h.intake.drain();

    assert_eq!(h.recorder.entries(6), 2);
    assert_eq!(h.recorder.exits(6), 2);
    assert!(!h.recorder.has_unprocessed_events(tessera_types::NodeId(6)));
}
