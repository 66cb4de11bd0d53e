//! Error taxonomy for the scheduler.
//!
//! Queue-level failures (`QueueFull`, `QueueDead`) are expected traffic —
//! callers are meant to match on them and choose a fallback, not treat
//! them as exceptional. `CapacityMisconfigured`, `RosterInconsistent` and
//! `Alloc` are construction-time failures; they are the only variants a
//! caller of [`Scheduler::new`](crate::scheduler::Scheduler::new) or
//! [`Scheduler::start`](crate::scheduler::Scheduler::start) should ever
//! see.

use failure::Fail;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "queue is at capacity")]
    QueueFull,
    #[fail(display = "operation attempted on a killed queue")]
    QueueDead,
    #[fail(display = "{} must be a power of two, got {}", _0, _1)]
    CapacityMisconfigured(&'static str, usize),
    #[fail(display = "worker {} missing from its own roster at start", _0)]
    RosterInconsistent(usize),
    #[fail(display = "failed to allocate {}: {}", _0, _1)]
    Alloc(&'static str, ::std::io::Error),
}

pub type Result<T> = ::std::result::Result<T, Error>;
