//! Bounded single-producer/multi-consumer work-stealing deque.
//!
//! Implements the Chase-Lev algorithm as refined for weak memory models by
//! Lê, Pop, Cohen and Zappa Nardelli ("Correct and Efficient Work-Stealing
//! for Weak Memory Models"). `push`/`take` are owner-only; `steal` may be
//! called by any other thread. Capacity is fixed at construction and never
//! grows — a full deque simply rejects the push, matching the
//! back-pressure model the rest of the scheduler relies on.
//!
//! The memory orderings below are load-bearing, not stylistic: the
//! `SeqCst` fence in [`take`](ChaseLevDeque::take) and the `SeqCst` fence
//! plus acquire loads in [`steal`](ChaseLevDeque::steal) are what
//! establish a single total order for the one-element race between the
//! owner and a thief. Weakening any of them reintroduces the classic
//! Chase-Lev double-pop bug on architectures with weaker memory models
//! than x86 (notably ARM).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicIsize, Ordering};

use crate::epoch;

/// A slot's value must be `Copy` and lock-free to load/store — the deque
/// stores job handles (raw pointers), never the jobs themselves.
pub trait Slot: Copy {}
impl<T> Slot for *mut T {}

struct Buffer<T: Slot> {
    mask: isize,
    cells: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T: Slot> Buffer<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "deque capacity must be a power of two");
        let cells = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Buffer {
            mask: capacity as isize - 1,
            cells,
        }
    }

    #[inline]
    unsafe fn write(&self, index: isize, value: T) {
        let cell = &self.cells[(index & self.mask) as usize];
        (*cell.get()).write(value);
    }

    #[inline]
    unsafe fn read(&self, index: isize) -> T {
        let cell = &self.cells[(index & self.mask) as usize];
        (*cell.get()).assume_init()
    }
}

// Safety: access to `cells` is disciplined by the bottom/top protocol
// below; every read is preceded by a happens-before edge that makes the
// corresponding write visible. `Slot` values are job handles (raw
// pointers) by design — the point of this structure is to move them
// across threads, so we assert `Send`/`Sync` unconditionally rather than
// bounding on `T: Send`, which raw pointer types never satisfy on their
// own.
unsafe impl<T: Slot> Send for Buffer<T> {}
unsafe impl<T: Slot> Sync for Buffer<T> {}

/// A bounded Chase-Lev work-stealing deque. The owning thread calls
/// [`push`](Self::push) and [`take`](Self::take); any other thread may
/// call [`steal`](Self::steal) concurrently.
pub struct ChaseLevDeque<T: Slot> {
    bottom: AtomicIsize,
    top: AtomicIsize,
    buffer: Buffer<T>,
}

unsafe impl<T: Slot> Send for ChaseLevDeque<T> {}
unsafe impl<T: Slot> Sync for ChaseLevDeque<T> {}

impl<T: Slot + 'static> ChaseLevDeque<T> {
    pub fn new(capacity: usize) -> Self {
        ChaseLevDeque {
            bottom: AtomicIsize::new(0),
            top: AtomicIsize::new(0),
            buffer: Buffer::new(capacity),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        (self.buffer.mask + 1) as usize
    }

    /// Approximate logical size. Racy against concurrent stealers, but
    /// never under-reports from the owner's point of view.
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner-only. Pushes `value` onto the bottom (LIFO) end. Returns
    /// `false` if the deque is at capacity.
    pub fn push(&self, value: T) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b - t >= self.buffer.mask + 1 {
            return false;
        }

        unsafe {
            self.buffer.write(b, value);
        }

        // Release: makes the write above visible to any thief that later
        // observes the new `bottom` with an acquire load.
        self.bottom.store(b + 1, Ordering::Release);
        true
    }

    /// Owner-only. Takes from the bottom (LIFO) end. Races with thieves
    /// only when exactly one element remains.
    pub fn take(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::Relaxed);

        // Pairs with the fence in `steal`; without it, the owner's read of
        // `top` below could be reordered ahead of the `bottom` store above
        // on weak-memory hardware, racing a concurrent steal undetected.
        fence(Ordering::SeqCst);

        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Deque was already empty; restore bottom.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let mut value = Some(unsafe { self.buffer.read(b) });

        if t == b {
            // Last element: race a thief for it.
            if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                value = None;
            }
            self.bottom.store(b + 1, Ordering::Relaxed);
        }

        value
    }

    /// May be called by any thread other than the owner. Steals from the
    /// top (FIFO) end.
    pub fn steal(&self) -> Option<T> {
        let _guard = epoch::pin();

        let t = self.top.load(Ordering::Acquire);

        // Pairs with the fence in `take`.
        fence(Ordering::SeqCst);

        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return None;
        }

        let value = unsafe { self.buffer.read(t) };

        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        Some(value)
    }
}

impl<T: Slot> Drop for ChaseLevDeque<T> {
    fn drop(&mut self) {
        // No further pushes/steals can race a drop (the deque is only
        // dropped once its owning worker's thread has been joined), but a
        // peer that began a `steal()` call microseconds earlier may still
        // hold a pin on the buffer. Retiring it rather than freeing it
        // synchronously keeps that read safe without requiring every
        // caller to prove the join happened-before the drop.
        let cells = std::mem::replace(&mut self.buffer.cells, Box::new([]));
        if cells.is_empty() {
            return;
        }
        let ptr = Box::into_raw(cells);
        epoch::pin().retire_with(move || unsafe {
            drop(Box::from_raw(ptr));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn boxed(v: usize) -> *mut usize {
        Box::into_raw(Box::new(v))
    }

    unsafe fn unboxed(p: *mut usize) -> usize {
        *Box::from_raw(p)
    }

    #[test]
    fn scenario_take_is_lifo() {
        let d = ChaseLevDeque::<*mut usize>::new(8);
        d.push(boxed(1));
        d.push(boxed(2));

        assert_eq!(unsafe { unboxed(d.take().unwrap()) }, 2);
        assert_eq!(unsafe { unboxed(d.take().unwrap()) }, 1);
        assert!(d.take().is_none());
    }

    #[test]
    fn scenario_steal_is_fifo() {
        let d = ChaseLevDeque::<*mut usize>::new(8);
        d.push(boxed(10));
        d.push(boxed(20));

        assert_eq!(unsafe { unboxed(d.steal().unwrap()) }, 10);
        assert_eq!(unsafe { unboxed(d.steal().unwrap()) }, 20);
        assert!(d.steal().is_none());
    }

    #[test]
    fn push_rejects_when_full() {
        let d = ChaseLevDeque::<*mut usize>::new(2);
        assert!(d.push(boxed(1)));
        assert!(d.push(boxed(2)));
        assert!(!d.push(boxed(3)));
        unsafe {
            unboxed(d.take().unwrap());
            unboxed(d.take().unwrap());
        }
    }

    #[test]
    fn full_coverage_under_steal_pressure() {
        const ITEMS: usize = 200_000;
        let deque = Arc::new(ChaseLevDeque::<*mut usize>::new(1024));

        for i in 0..ITEMS {
            while !deque.push(boxed(i)) {
                while let Some(p) = deque.take() {
                    unsafe { unboxed(p) };
                }
            }
        }

        let seen: Arc<std::sync::Mutex<HashSet<usize>>> =
            Arc::new(std::sync::Mutex::new(HashSet::new()));
        let stop = Arc::new(AtomicUsize::new(0));

        let mut thieves = Vec::new();
        for _ in 0..8 {
            let deque = deque.clone();
            let seen = seen.clone();
            let stop = stop.clone();
            thieves.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                while stop.load(Ordering::Relaxed) == 0 {
                    if let Some(p) = deque.steal() {
                        seen.lock().unwrap().insert(unsafe { unboxed(p) });
                    } else if rng.gen_range(0, 64) == 0 {
                        // Occasional jitter so thieves don't all hammer the
                        // same instant in lockstep, which would under-stress
                        // the top/bottom race this test exists to cover.
                        thread::yield_now();
                    }
                }
                while let Some(p) = deque.steal() {
                    seen.lock().unwrap().insert(unsafe { unboxed(p) });
                }
            }));
        }

        while let Some(p) = deque.take() {
            seen.lock().unwrap().insert(unsafe { unboxed(p) });
        }
        stop.store(1, Ordering::Relaxed);

        for t in thieves {
            t.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), ITEMS);
        for i in 0..ITEMS {
            assert!(seen.contains(&i));
        }
    }
}
