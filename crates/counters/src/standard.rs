//! Unbounded counter.

use crate::gate::Gate;
use crate::{CounterError, ObjectCounter};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often an empty-waiter re-checks for cancellation.
const DEFAULT_POLL: Duration = Duration::from_millis(10);

/// Counts objects without ever applying backpressure.
///
/// Useful where a stage needs to be drained (`wait_until_empty`) but must
/// not slow its producers down.
#[derive(Debug)]
pub struct StandardObjectCounter {
    name: String,
    gate: Gate,
}

impl StandardObjectCounter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gate: Gate::new(DEFAULT_POLL),
        }
    }
}

impl ObjectCounter for StandardObjectCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_ramp(&self) {
        self.gate.force_increment();
    }

    fn interruptable_on_ramp(&self, _cancel: &CancellationToken) -> Result<(), CounterError> {
        self.gate.force_increment();
        Ok(())
    }

    fn attempt_on_ramp(&self) -> bool {
        self.gate.force_increment();
        true
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
            .map_err(|_| CounterError::Interrupted {
                name: self.name.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_on_and_off_ramp() {
        let counter = StandardObjectCounter::new("test");
        counter.on_ramp();
        assert!(counter.attempt_on_ramp());
        counter.force_on_ramp();
        assert_eq!(counter.count(), 3);

        counter.off_ramp();
        counter.off_ramp();
        counter.off_ramp();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    #[should_panic(expected = "off-ramped more objects")]
    fn test_extra_off_ramp_panics() {
        let counter = StandardObjectCounter::new("test");
        counter.on_ramp();
        counter.off_ramp();
        counter.off_ramp();
    }

    #[test]
    fn test_wait_until_empty_wakes_on_last_off_ramp() {
        let counter = Arc::new(StandardObjectCounter::new("test"));
        counter.on_ramp();
        counter.on_ramp();

        let consumer = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                counter.off_ramp();
                counter.off_ramp();
            })
        };

        counter.wait_until_empty();
        assert_eq!(counter.count(), 0);
        consumer.join().unwrap();
    }

    #[test]
    fn test_interrupted_wait_leaves_count() {
        let counter = StandardObjectCounter::new("test");
        counter.on_ramp();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = counter.interruptable_wait_until_empty(&cancel);
        assert_eq!(
            result,
            Err(CounterError::Interrupted {
                name: "test".to_string()
            })
        );
        assert_eq!(counter.count(), 1);
    }
}
