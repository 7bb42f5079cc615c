//! Counter that counts nothing.

use crate::{CounterError, ObjectCounter};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Stands in for a counter on stages with no configured limit, so call sites
/// always have a counter to talk to.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCounter;

impl NoOpCounter {
    /// Value returned by [`ObjectCounter::count`].
    pub const UNCOUNTED: i64 = -1;

    /// The shared instance.
    pub fn instance() -> Arc<dyn ObjectCounter> {
        static INSTANCE: OnceLock<Arc<NoOpCounter>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(NoOpCounter)).clone()
    }
}

impl ObjectCounter for NoOpCounter {
    fn name(&self) -> &str {
        "no-op"
    }

    fn on_ramp(&self) {}

    fn interruptable_on_ramp(&self, _cancel: &CancellationToken) -> Result<(), CounterError> {
        Ok(())
    }

    fn attempt_on_ramp(&self) -> bool {
        true
    }

    fn force_on_ramp(&self) {}

    fn off_ramp(&self) {}

    fn count(&self) -> i64 {
        Self::UNCOUNTED
    }

    fn wait_until_empty(&self) {}

    fn interruptable_wait_until_empty(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<(), CounterError> {
        Ok(())
    }
}
