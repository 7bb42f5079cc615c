//! The object counter contract.

use crate::CounterError;
use tokio_util::sync::CancellationToken;

/// Counts objects in flight through one or more pipeline stages.
///
/// A producer calls an on-ramp method before handing an object to a stage and
/// the consumer calls [`off_ramp`](Self::off_ramp) once it is done with it.
/// Counters with a capacity make the blocking on-ramps wait for room, which
/// is how backpressure propagates upstream.
///
/// Cancellation of an interruptable method is not an error condition for
/// the counter: it returns [`CounterError::Interrupted`] and leaves the count
/// unchanged.
pub trait ObjectCounter: Send + Sync + std::fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Wait until there is room, then count one object.
    fn on_ramp(&self);

    /// As [`on_ramp`](Self::on_ramp), giving up if `cancel` fires.
    fn interruptable_on_ramp(&self, cancel: &CancellationToken) -> Result<(), CounterError>;

    /// Count one object if there is room right now. Never blocks.
    fn attempt_on_ramp(&self) -> bool;

    /// Count one object regardless of capacity.
    fn force_on_ramp(&self);

    /// Stop counting one object.
    ///
    /// # Panics
    ///
    /// Panics if this would make the count negative.
    fn off_ramp(&self);

    /// Current count. Uncounted implementations return a negative sentinel.
    fn count(&self) -> i64;

    /// Block until the count reaches zero.
    fn wait_until_empty(&self);

    /// As [`wait_until_empty`](Self::wait_until_empty), giving up if `cancel`
    /// fires.
    fn interruptable_wait_until_empty(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), CounterError>;
}
