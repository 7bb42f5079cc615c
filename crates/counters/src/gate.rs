//! Shared count and wake-up machinery for the real counters.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// An atomic count plus a condition variable that is signalled whenever the
/// count goes down.
///
/// Increments are lock-free. Waiters re-check their condition under `lock`,
/// and decrements notify under the same lock, so a wake-up cannot slip in
/// between a waiter's check and its park.
#[derive(Debug)]
pub(crate) struct Gate {
    count: AtomicI64,
    lock: Mutex<()>,
    decreased: Condvar,
    poll: Duration,
}

/// Returned by [`Gate::wait`] when the token fired first.
pub(crate) struct Cancelled;

impl Gate {
    /// `poll` bounds how long a waiter sleeps before re-checking on its own
    /// (cancellation does not signal the condvar).
    pub(crate) fn new(poll: Duration) -> Self {
        Self {
            count: AtomicI64::new(0),
            lock: Mutex::new(()),
            decreased: Condvar::new(),
            poll,
        }
    }

    pub(crate) fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn force_increment(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Increment only if the count is below `capacity`.
    pub(crate) fn try_increment(&self, capacity: i64) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < capacity).then_some(current + 1)
            })
            .is_ok()
    }

    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub(crate) fn decrement(&self, name: &str) {
        let decremented = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then_some(current - 1)
            });
        if decremented.is_err() {
            panic!("counter '{name}' off-ramped more objects than were on-ramped");
        }

        let _guard = self.lock.lock();
        self.decreased.notify_all();
    }

    /// Block until `ready` returns true. `ready` is evaluated with the gate's
    /// lock held and may itself change the count.
    pub(crate) fn wait(
        &self,
        cancel: Option<&CancellationToken>,
        mut ready: impl FnMut() -> bool,
    ) -> Result<(), Cancelled> {
        let mut guard = self.lock.lock();
        loop {
            if ready() {
                return Ok(());
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(Cancelled);
            }
            self.decreased.wait_for(&mut guard, self.poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_increment_respects_capacity() {
        let gate = Gate::new(Duration::from_millis(1));
        assert!(gate.try_increment(2));
        assert!(gate.try_increment(2));
        assert!(!gate.try_increment(2));
        assert_eq!(gate.count(), 2);
    }

    #[test]
    fn test_wait_returns_when_cancelled() {
        let gate = Gate::new(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(gate.wait(Some(&cancel), || false).is_err());
    }

    #[test]
    #[should_panic(expected = "off-ramped more objects")]
    fn test_decrement_below_zero_panics() {
        let gate = Gate::new(Duration::from_millis(1));
        gate.decrement("test");
    }
}
