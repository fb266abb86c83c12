//! Timing primitives backing the timeout supervisor.
//!
//! The wheel is not synchronized; the supervisor owns it behind a mutex and
//! drives it from a single ticking thread.

mod slab;
pub(crate) mod wheel;

pub use wheel::{PowerOfTwo, TimerHandle, Wheel};
