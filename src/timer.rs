//! Timer primitives: a hashed timing wheel and its slot storage.
//!
//! [`TimingWheel`] schedules values to become ready after a bounded delay
//! with O(1) insert and O(1)-average cancel. It knows nothing about I/O or
//! callbacks; the reactor owns one and fires whatever it reports ready.
//!
//! Time never comes from a hidden clock: every operation that needs "now"
//! takes an [`std::time::Instant`] argument, so tests drive the wheel with a
//! fake clock and production passes `Instant::now()`.

mod slot;
mod wheel;

pub use slot::SlotSpace;
pub use wheel::{TimerError, TimerHandle, TimingWheel};
