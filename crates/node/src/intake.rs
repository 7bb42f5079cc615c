//! Event intake: gossip → bounded queue → deduplicator → consensus.

use crate::IntakeError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tessera_core::{ClearTrigger, IntakeEventCounter};
use tessera_counters::ObjectCounter;
use tessera_dedup::EventDeduplicator;
use tessera_types::{AncientWindow, GossipEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Idle time after which the duplicate rate gauge is rolled forward.
const METRICS_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Front of the intake pipeline.
///
/// Submitters on-ramp the queue counter before handing an event to the
/// worker thread, so a bounded counter blocks gossip when deduplication
/// falls behind. The worker off-ramps each event once it has been
/// deduplicated and, if accepted, forwarded downstream.
///
/// Every submitted event from a peer is recorded with the intake event
/// counter. The deduplicator reports the exit of events it drops; whoever
/// consumes the downstream channel reports the rest.
pub struct IntakePipeline {
    sender: Mutex<Option<Sender<GossipEvent>>>,
    counter: Arc<dyn ObjectCounter>,
    intake_event_counter: Arc<dyn IntakeEventCounter>,
    deduplicator: Arc<EventDeduplicator>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IntakePipeline {
    /// Start the worker thread.
    ///
    /// `counter` bounds the queue; `downstream` receives accepted events.
    pub fn start(
        counter: Arc<dyn ObjectCounter>,
        deduplicator: Arc<EventDeduplicator>,
        intake_event_counter: Arc<dyn IntakeEventCounter>,
        downstream: Sender<GossipEvent>,
    ) -> Result<Self, IntakeError> {
        let (sender, receiver) = channel::unbounded();

        let worker = {
            let counter = Arc::clone(&counter);
            let deduplicator = Arc::clone(&deduplicator);
            let intake_event_counter = Arc::clone(&intake_event_counter);
            thread::Builder::new()
                .name("event-intake".to_string())
                .spawn(move || {
                    run_worker(
                        &receiver,
                        &*counter,
                        &deduplicator,
                        &*intake_event_counter,
                        &downstream,
                    )
                })
                .map_err(IntakeError::Spawn)?
        };

        info!(counter = counter.name(), "Event intake started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            counter,
            intake_event_counter,
            deduplicator,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `event`, blocking while the queue is full.
    pub fn submit(&self, event: GossipEvent) -> Result<(), IntakeError> {
        self.counter.on_ramp();
        self.enqueue(event)
    }

    /// Queue `event` if there is room, otherwise hand it back.
    pub fn try_submit(&self, event: GossipEvent) -> Result<(), IntakeError> {
        if !self.counter.attempt_on_ramp() {
            return Err(IntakeError::Full(Box::new(event)));
        }
        self.enqueue(event)
    }

    /// Queue `event`, blocking while the queue is full unless `cancel` fires.
    pub fn submit_interruptable(
        &self,
        event: GossipEvent,
        cancel: &CancellationToken,
    ) -> Result<(), IntakeError> {
        self.counter.interruptable_on_ramp(cancel)?;
        self.enqueue(event)
    }

    /// Hand an on-ramped event to the worker.
    fn enqueue(&self, event: GossipEvent) -> Result<(), IntakeError> {
        let sender_id = event.sender_id;
        self.intake_event_counter
            .event_entered_intake_pipeline(sender_id);

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        };
        if !sent {
            self.counter.off_ramp();
            self.intake_event_counter
                .event_exited_intake_pipeline(sender_id);
            return Err(IntakeError::Closed);
        }
        Ok(())
    }

    /// Install a newer ancient window.
    pub fn set_window(&self, window: AncientWindow) {
        self.deduplicator.set_window(window);
    }

    /// Forget every event seen so far.
    pub fn clear(&self, trigger: ClearTrigger) {
        self.deduplicator.clear(trigger);
    }

    /// Block until every queued event has been processed.
    pub fn drain(&self) {
        self.counter.wait_until_empty();
    }

    /// Events queued or being processed.
    pub fn queued(&self) -> i64 {
        self.counter.count()
    }

    pub fn deduplicator(&self) -> &EventDeduplicator {
        &self.deduplicator
    }

    /// Stop accepting events, process what is queued, and join the worker.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("Event intake worker panicked");
            }
            info!("Event intake stopped");
        }
    }
}

impl Drop for IntakePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    receiver: &Receiver<GossipEvent>,
    counter: &dyn ObjectCounter,
    deduplicator: &EventDeduplicator,
    intake_event_counter: &dyn IntakeEventCounter,
    downstream: &Sender<GossipEvent>,
) {
    let mut downstream_closed = false;
    loop {
        let event = match receiver.recv_timeout(METRICS_REFRESH_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                deduplicator.metrics().refresh();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if let Some(accepted) = deduplicator.handle(event) {
            if let Err(channel::SendError(event)) = downstream.send(accepted) {
                if !downstream_closed {
                    warn!("Downstream closed, dropping accepted events");
                    downstream_closed = true;
                }
                debug!(creator = %event.descriptor.creator, "Dropped accepted event");
                intake_event_counter.event_exited_intake_pipeline(event.sender_id);
            }
        }
        counter.off_ramp();
    }
}
