//! Epoch-based reclamation (EBR).
//!
//! Lets a thread retire a pointer that other threads might still be
//! dereferencing through a lock-free structure, and defers the actual
//! free until it is provable that no such thread is still "inside" a
//! critical section that started before the retire.
//!
//! The protocol mirrors the one used by the scheduler's local deques:
//! a thread entering a critical section publishes `local = global`; on
//! exit it publishes an "idle" sentinel. A retired pointer stamped at
//! epoch `e` may be freed once every registered thread's local epoch is
//! either idle or `>= e + 2`. The `+2` gap is what lets a single
//! `try_advance_epoch()` call per `retire()` batch be enough: it takes
//! at most two advances for every thread to have either left the old
//! epoch or observed the new one.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

const MAX_THREADS: usize = 256;
const RETIRE_THRESHOLD: usize = 96;
const IDLE: u64 = u64::MAX;

static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(0);
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

const SLOT_INIT: AtomicPtr<AtomicU64> = AtomicPtr::new(ptr::null_mut());
static SLOTS: [AtomicPtr<AtomicU64>; MAX_THREADS] = [SLOT_INIT; MAX_THREADS];

type Deleter = Box<dyn FnOnce()>;

struct Retired {
    epoch: u64,
    run: Deleter,
}

struct Registration {
    id: usize,
}

impl Registration {
    fn new() -> Self {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        assert!(
            id < MAX_THREADS,
            "epoch reclamation thread registry exhausted (cap is {})",
            MAX_THREADS
        );

        LOCAL_EPOCH.with(|local| {
            let ptr = local as *const AtomicU64 as *mut AtomicU64;
            SLOTS[id].store(ptr, Ordering::Release);
        });

        Registration { id }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        SLOTS[self.id].store(ptr::null_mut(), Ordering::Release);
        RETIRED.with(|r| {
            for retired in r.borrow_mut().drain(..) {
                (retired.run)();
            }
        });
    }
}

thread_local! {
    static REGISTRATION: Registration = Registration::new();
    static LOCAL_EPOCH: AtomicU64 = AtomicU64::new(IDLE);
    static IN_CRITICAL: Cell<bool> = Cell::new(false);
    static RETIRED: RefCell<Vec<Retired>> = RefCell::new(Vec::new());
}

fn min_local_epoch() -> u64 {
    let mut min = u64::MAX;
    for slot in &SLOTS {
        let ptr = slot.load(Ordering::Acquire);
        if ptr.is_null() {
            continue;
        }

        // Safety: a non-null slot always points at a `LOCAL_EPOCH` cell that
        // is alive for as long as its owning thread is registered, and the
        // registration is cleared (the slot is nulled) before that thread's
        // thread-local storage is torn down.
        let epoch = unsafe { (*ptr).load(Ordering::Acquire) };
        if epoch < min {
            min = epoch;
        }
    }

    min
}

fn try_advance_epoch() {
    let current = GLOBAL_EPOCH.load(Ordering::Acquire);
    if min_local_epoch() >= current {
        let _ = GLOBAL_EPOCH.compare_exchange(
            current,
            current + 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

fn try_reclaim() {
    let min = min_local_epoch();
    RETIRED.with(|r| {
        let mut retired = r.borrow_mut();
        let mut i = 0;
        while i < retired.len() {
            if retired[i].epoch + 2 <= min {
                let entry = retired.swap_remove(i);
                (entry.run)();
            } else {
                i += 1;
            }
        }
    });
}

/// RAII guard for an EBR critical section. Acquired via [`pin`]. Nested
/// acquisitions on the same thread are no-ops: only the outermost guard
/// publishes/clears the thread's local epoch.
pub struct Guard {
    nested: bool,
}

impl Guard {
    /// Records `ptr` for deferred destruction once no critical section that
    /// could have observed it remains open. `run` is invoked exactly once,
    /// on whichever thread happens to perform the reclaiming sweep.
    pub fn retire<T: Send + 'static>(&self, ptr: *mut T) {
        debug_assert!(!ptr.is_null());
        self.retire_with(move || unsafe {
            drop(Box::from_raw(ptr));
        });
    }

    /// Like [`Guard::retire`], but with a caller-supplied destructor instead
    /// of assuming the pointer owns a `Box` allocation.
    pub fn retire_with<F: FnOnce() + 'static>(&self, run: F) {
        REGISTRATION.with(|_| {}); // ensure this thread is registered
        let epoch = LOCAL_EPOCH.with(|e| e.load(Ordering::Relaxed));
        let epoch = if epoch == IDLE {
            GLOBAL_EPOCH.load(Ordering::Acquire)
        } else {
            epoch
        };

        let len = RETIRED.with(|r| {
            let mut retired = r.borrow_mut();
            retired.push(Retired {
                epoch,
                run: Box::new(run),
            });
            retired.len()
        });

        if len >= RETIRE_THRESHOLD {
            try_advance_epoch();
            try_reclaim();
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if !self.nested {
            IN_CRITICAL.with(|c| c.set(false));
            LOCAL_EPOCH.with(|e| e.store(IDLE, Ordering::Release));
        }
    }
}

/// Enters an EBR critical section for the current thread, registering it
/// with the reclamation subsystem on first use. While the returned [`Guard`]
/// is alive, any pointer retired by any thread (at or after the epoch
/// observed here) is guaranteed to remain valid.
pub fn pin() -> Guard {
    REGISTRATION.with(|_| {}); // first-use registration

    if IN_CRITICAL.with(|c| c.get()) {
        return Guard { nested: true };
    }

    IN_CRITICAL.with(|c| c.set(true));
    LOCAL_EPOCH.with(|e| e.store(GLOBAL_EPOCH.load(Ordering::Acquire), Ordering::Release));
    Guard { nested: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn retire_runs_eventually() {
        let ran = Arc::new(AtomicBool::new(false));
        {
            let guard = pin();
            let ran = ran.clone();
            guard.retire_with(move || ran.store(true, Ordering::SeqCst));
        }

        // force the sweep deterministically rather than waiting for the
        // retire-count threshold.
        try_advance_epoch();
        try_advance_epoch();
        try_reclaim();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn nested_pin_is_noop() {
        let outer = pin();
        let epoch_before = LOCAL_EPOCH.with(|e| e.load(Ordering::Relaxed));
        {
            let _inner = pin();
            assert_eq!(epoch_before, LOCAL_EPOCH.with(|e| e.load(Ordering::Relaxed)));
        }
        assert_eq!(epoch_before, LOCAL_EPOCH.with(|e| e.load(Ordering::Relaxed)));
        drop(outer);
        assert_eq!(IDLE, LOCAL_EPOCH.with(|e| e.load(Ordering::Relaxed)));
    }

    #[test]
    fn retire_survives_concurrent_pins() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..256 {
                    let guard = pin();
                    let counter = counter.clone();
                    guard.retire_with(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        // drive remaining retires to completion
        for _ in 0..8 {
            try_advance_epoch();
            try_reclaim();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 4 * 256);
    }
}
