//! Backoff ladder used by a worker that finds nothing to do: spin first,
//! then yield the OS thread, then fall back to a blocking wait.
//!
//! Grounded in the same spin/yield staging the original scheduler used
//! around its `cpu_relax()` hint, but expressed as a small stateful helper
//! instead of an inline loop so [`Worker`](crate::worker::Worker) can drive
//! it across calls.

use std::hint;
use std::thread;

/// Spin for up to this many consecutive misses before switching to
/// `thread::yield_now`.
const SPIN_LIMIT: u32 = 2_000;

/// Yield for up to this many consecutive misses before falling back to a
/// blocking wait on the global queue.
const YIELD_LIMIT: u32 = 10_000;

/// Tracks how many consecutive empty polls a worker has made and decides
/// what to do about it.
#[derive(Default)]
pub struct Backoff {
    misses: u32,
}

/// What a worker should do on its next miss, per the ladder in §4.5.
pub enum Step {
    /// Issue a CPU-relax hint and try again immediately.
    Spin,
    /// Yield the OS thread and try again.
    Yield,
    /// Give up polling; block on the global queue instead.
    Park,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { misses: 0 }
    }

    /// Records a failed poll and returns the action to take.
    pub fn miss(&mut self) -> Step {
        self.misses = self.misses.saturating_add(1);
        if self.misses <= SPIN_LIMIT {
            hint::spin_loop();
            Step::Spin
        } else if self.misses <= YIELD_LIMIT {
            thread::yield_now();
            Step::Yield
        } else {
            Step::Park
        }
    }

    /// Resets the ladder after a successful poll.
    pub fn reset(&mut self) {
        self.misses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_progresses_through_stages() {
        let mut b = Backoff::new();
        for _ in 0..SPIN_LIMIT {
            assert!(matches!(b.miss(), Step::Spin));
        }
        for _ in 0..(YIELD_LIMIT - SPIN_LIMIT) {
            assert!(matches!(b.miss(), Step::Yield));
        }
        assert!(matches!(b.miss(), Step::Park));
        assert!(matches!(b.miss(), Step::Park));
    }

    #[test]
    fn reset_returns_to_spin() {
        let mut b = Backoff::new();
        for _ in 0..(YIELD_LIMIT + 5) {
            b.miss();
        }
        b.reset();
        assert!(matches!(b.miss(), Step::Spin));
    }
}
