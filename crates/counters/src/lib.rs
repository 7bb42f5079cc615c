//! Object counters for flow control between pipeline stages.
//!
//! A counter tracks how many objects are between an on-ramp (where a
//! producer hands work to a stage) and an off-ramp (where a consumer is done
//! with it). Bounded counters block producers when a stage falls behind:
//!
//! - [`StandardObjectCounter`]: unbounded, drainable.
//! - [`BackpressureObjectCounter`]: blocks on-ramps at a fixed capacity.
//! - [`NoOpCounter`]: counts nothing.
//! - [`MultiObjectCounter`]: fans one object out to several counters.

mod backpressure;
mod error;
mod gate;
mod multi;
mod noop;
mod standard;
mod traits;

pub use backpressure::BackpressureObjectCounter;
pub use error::CounterError;
pub use multi::MultiObjectCounter;
pub use noop::NoOpCounter;
pub use standard::StandardObjectCounter;
pub use traits::ObjectCounter;
