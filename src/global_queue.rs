//! Bounded multi-producer/multi-consumer queue shared by every worker and
//! by external submitters.
//!
//! This is the Vyukov bounded MPMC array queue: a ring buffer where each
//! slot carries its own sequence number, so producers and consumers can
//! claim slots with a single fetch-add on `head`/`tail` and then spin
//! locally on the slot's sequence rather than contending a second time.
//! Capacity is fixed at construction and must be a power of two.
//!
//! Workers push to this queue only when their local deque is full, and
//! pull from it only once their local deque (and a steal attempt) have
//! both come up empty, so contention here is expected to be the
//! exception rather than the rule.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded MPMC queue. `push` fails (rather than blocking) once the
/// queue is full; `pop` and [`blocking_pop`](Self::blocking_pop) both
/// return `None`/block respectively only when the queue is empty.
pub struct GlobalQueue<T> {
    mask: usize,
    slots: Box<[Slot<T>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    killed: AtomicBool,
    parked: Mutex<()>,
    wake: Condvar,
}

// Safety: `Slot<T>`'s sequence number is the sole arbiter of which thread
// may touch `value` at any moment; no two threads ever observe the slot
// as claimed at the same time. As with the local deque, `T` here is a
// job handle (raw pointer) by design, so we assert `Send`/`Sync`
// unconditionally rather than bounding on `T: Send`.
unsafe impl<T> Send for GlobalQueue<T> {}
unsafe impl<T> Sync for GlobalQueue<T> {}

impl<T> GlobalQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "global queue capacity must be a power of two");

        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        GlobalQueue {
            mask: capacity - 1,
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            killed: AtomicBool::new(false),
            parked: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Attempts to enqueue `value`. Returns it back on failure, which
    /// happens only when the queue is at capacity — per §4.7, a killed
    /// queue still accepts/yields items normally until it is drained;
    /// `killed` only gates the blocking variants below.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                if self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe {
                        (*slot.value.get()).write(value);
                    }
                    slot.sequence.store(pos + 1, Ordering::Release);

                    let _guard = self.parked.lock().unwrap();
                    self.wake.notify_one();
                    return Ok(());
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue without blocking. Returns `None` if the queue
    /// is currently empty.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos as isize + 1);

            if diff == 0 {
                if self
                    .head
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.sequence.store(pos + self.mask + 1, Ordering::Release);
                    return Some(value);
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Blocks until space is available or the queue is killed.
    pub fn blocking_push(&self, mut value: T) -> Result<(), T> {
        loop {
            match self.push(value) {
                Ok(()) => return Ok(()),
                Err(v) => value = v,
            }

            if self.killed.load(Ordering::Acquire) {
                return Err(value);
            }

            std::thread::yield_now();
        }
    }

    /// Blocks until an item is available or the queue is killed, in which
    /// case `None` is returned once the queue has also drained.
    pub fn blocking_pop(&self) -> Option<T> {
        loop {
            if let Some(value) = self.pop() {
                return Some(value);
            }

            if self.killed.load(Ordering::Acquire) {
                // One last check: a push could have landed between our
                // failed pop and observing `killed`.
                if let Some(value) = self.pop() {
                    return Some(value);
                }
                return None;
            }

            let guard = self.parked.lock().unwrap();
            // Re-check under the lock to avoid a lost wakeup between the
            // pop attempt above and parking here.
            if !self.is_empty() || self.killed.load(Ordering::Acquire) {
                continue;
            }
            let _ = self
                .wake
                .wait_timeout(guard, std::time::Duration::from_millis(50))
                .unwrap();
        }
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head == tail
    }

    /// Marks the queue killed and wakes every thread blocked in
    /// [`blocking_pop`](Self::blocking_pop)/[`blocking_push`](Self::blocking_push).
    /// Killing does not discard items already queued; they continue to be
    /// poppable until drained.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        let _guard = self.parked.lock().unwrap();
        self.wake.notify_all();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Drains whatever is left and clears the killed flag, returning the
    /// queue to the `Alive` state. Used only by
    /// [`Scheduler::start`](crate::scheduler::Scheduler::start) to roll a
    /// partially-started scheduler back to a clean slate after a worker
    /// thread fails to spawn; §4.6's "reset the queue" step.
    pub(crate) fn revive(&self, _capacity_hint: usize) {
        while self.pop().is_some() {}
        self.killed.store(false, Ordering::Release);
    }
}

impl<T> Drop for GlobalQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn scenario_fifo_basic() {
        let q = GlobalQueue::new(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn push_fails_when_full() {
        let q = GlobalQueue::new(2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.pop(), Some(1));
        assert!(q.push(3).is_ok());
    }

    #[test]
    fn kill_wakes_blocked_consumer() {
        let q = Arc::new(GlobalQueue::<i32>::new(8));
        let reader = {
            let q = q.clone();
            thread::spawn(move || q.blocking_pop())
        };

        thread::sleep(std::time::Duration::from_millis(20));
        q.kill();
        assert_eq!(reader.join().unwrap(), None);
    }

    #[test]
    fn kill_still_drains_queued_items() {
        let q = Arc::new(GlobalQueue::new(8));
        q.push(42).unwrap();
        q.kill();
        assert_eq!(q.blocking_pop(), Some(42));
        assert_eq!(q.blocking_pop(), None);
    }

    #[test]
    fn push_still_succeeds_after_kill_while_capacity_remains() {
        // §4.7: "In Killed, push/pop still succeed while items remain."
        // A flushed shutdown (Scheduler::stop(flush = true)) kills the
        // queue and only then drains it, re-pushing any job that splits
        // mid-drain — that re-push must not be silently rejected just
        // because the queue is already killed.
        let q = GlobalQueue::new(4);
        q.kill();
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn stress_multi_producer_multi_consumer() {
        const PRODUCERS: usize = 6;
        const PER_PRODUCER: usize = 20_000;
        let q = Arc::new(GlobalQueue::new(1024));
        let produced = Arc::new(StdAtomicUsize::new(0));

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let q = q.clone();
            let produced = produced.clone();
            producers.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    loop {
                        if q.push(value).is_ok() {
                            produced.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }));
        }

        let total = PRODUCERS * PER_PRODUCER;
        let seen = Arc::new(Mutex::new(vec![false; total]));
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let seen = seen.clone();
            consumers.push(thread::spawn(move || {
                let mut count = 0;
                loop {
                    match q.blocking_pop() {
                        Some(v) => {
                            seen.lock().unwrap()[v] = true;
                            count += 1;
                        }
                        None => break,
                    }
                }
                count
            }));
        }

        for p in producers {
            p.join().unwrap();
        }
        q.kill();

        let consumed: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(consumed, total);
        assert!(seen.lock().unwrap().iter().all(|&b| b));
    }
}
