//! Capacity-limited counter.

use crate::gate::Gate;
use crate::{CounterError, ObjectCounter};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A counter that blocks on-ramps while `capacity` objects are in flight.
///
/// Blocked callers park on a condition variable that every `off_ramp`
/// signals, and re-check at least every `sleep` so cancellation is noticed
/// promptly.
///
/// One instance is usually shared between the stage that on-ramps (the
/// producer side of a queue) and the stage that off-ramps (the consumer),
/// which may be several hops apart.
#[derive(Debug)]
pub struct BackpressureObjectCounter {
    name: String,
    capacity: i64,
    gate: Gate,
}

impl BackpressureObjectCounter {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(name: impl Into<String>, capacity: u64, sleep: Duration) -> Self {
        let name = name.into();
        assert!(capacity > 0, "counter '{name}' needs a capacity of at least 1");
        Self {
            name,
            capacity: i64::try_from(capacity).unwrap_or(i64::MAX),
            gate: Gate::new(sleep),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    fn interrupted(&self) -> CounterError {
        CounterError::Interrupted {
            name: self.name.clone(),
        }
    }
}

impl ObjectCounter for BackpressureObjectCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_ramp(&self) {
        if self.gate.try_increment(self.capacity) {
            return;
        }
        trace!(counter = %self.name, capacity = self.capacity, "Backpressure engaged");
        let _ = self
            .gate
            .wait(None, || self.gate.try_increment(self.capacity));
    }

    fn interruptable_on_ramp(&self, cancel: &CancellationToken) -> Result<(), CounterError> {
        if self.gate.try_increment(self.capacity) {
            return Ok(());
        }
        trace!(counter = %self.name, capacity = self.capacity, "Backpressure engaged");
        self.gate
            .wait(Some(cancel), || self.gate.try_increment(self.capacity))
            .map_err(|_| self.interrupted())
    }

    fn attempt_on_ramp(&self) -> bool {
        self.gate.try_increment(self.capacity)
    }

    fn force_on_ramp(&self) {
        self.gate.force_increment();
    }

    fn off_ramp(&self) {
        self.gate.decrement(&self.name);
    }

    fn count(&self) -> i64 {
        self.gate.count()
    }

    fn wait_until_empty(&self) {
        let _ = self.gate.wait(None, || self.gate.count() == 0);
    }

    fn interruptable_wait_until_empty(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), CounterError> {
        self.gate
            .wait(Some(cancel), || self.gate.count() == 0)
            .map_err(|_| self.interrupted())
    }
}
