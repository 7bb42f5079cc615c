//! Fan-out counter.

use crate::{CounterError, ObjectCounter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Applies every on-ramp and off-ramp to several counters at once.
///
/// Used when one object occupies several stages that each have their own
/// counter (for example a per-stage limit plus a pipeline-wide limit).
///
/// The first child is authoritative: [`attempt_on_ramp`](ObjectCounter::attempt_on_ramp)
/// asks only the first child, then force-admits the rest, so the children
/// are incremented all together or not at all. [`count`](ObjectCounter::count)
/// reports the first child.
#[derive(Debug)]
pub struct MultiObjectCounter {
    name: String,
    counters: Vec<Arc<dyn ObjectCounter>>,
}

impl MultiObjectCounter {
    pub fn new(counters: Vec<Arc<dyn ObjectCounter>>) -> Result<Self, CounterError> {
        if counters.is_empty() {
            return Err(CounterError::EmptyMultiCounter);
        }
        let names: Vec<&str> = counters.iter().map(|c| c.name()).collect();
        let name = format!("multi[{}]", names.join(","));
        Ok(Self { name, counters })
    }

    pub fn counters(&self) -> &[Arc<dyn ObjectCounter>] {
        &self.counters
    }

    fn authority(&self) -> &Arc<dyn ObjectCounter> {
        &self.counters[0]
    }
}

impl ObjectCounter for MultiObjectCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_ramp(&self) {
        for counter in &self.counters {
            counter.on_ramp();
        }
    }

    /// On cancellation, children that had already admitted the object are
    /// off-ramped again so no child is left holding a partial admission.
    fn interruptable_on_ramp(&self, cancel: &CancellationToken) -> Result<(), CounterError> {
        for (index, counter) in self.counters.iter().enumerate() {
            if let Err(err) = counter.interruptable_on_ramp(cancel) {
                for admitted in &self.counters[..index] {
                    admitted.off_ramp();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn attempt_on_ramp(&self) -> bool {
        if !self.authority().attempt_on_ramp() {
            return false;
        }
        for counter in &self.counters[1..] {
            counter.force_on_ramp();
        }
        true
    }

    fn force_on_ramp(&self) {
        for counter in &self.counters {
            counter.force_on_ramp();
        }
    }

    fn off_ramp(&self) {
        for counter in &self.counters {
            counter.off_ramp();
        }
    }

    fn count(&self) -> i64 {
        self.authority().count()
    }

    fn wait_until_empty(&self) {
        for counter in &self.counters {
            counter.wait_until_empty();
        }
    }

    fn interruptable_wait_until_empty(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), CounterError> {
        for counter in &self.counters {
            counter.interruptable_wait_until_empty(cancel)?;
        }
        Ok(())
    }
}
