//! The job object model: a callable paired with range-splitting state and
//! parent/child bookkeeping, plus the thread-local pool jobs are
//! allocated from and returned to.
//!
//! A job is always owned by exactly one worker at a time: the worker
//! that popped/stole/took it, until that worker either finishes it or
//! hands a child half to another worker via the local deque. Nothing
//! ever reads or writes a job's interior concurrently except the
//! `children` counter, which every finisher (self or a completing child)
//! touches via [`Pool::finish`].
//!
//! `children` is a join counter in the classic fork-join sense, not a
//! literal "how many children remain" count: it starts at 1, standing
//! for the job's own not-yet-executed slice, and gets one more unit for
//! every child `split` spins off. A job is only fully done — eligible to
//! release itself and propagate completion to its own parent — once
//! every one of those units, self included, has checked in. That is what
//! lets the owning worker run a job's own (post-split) slice immediately
//! without waiting on children, while still guaranteeing a parent never
//! resumes before the full subtree it spawned has finished.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::worker::Worker;

/// The range and batching configuration a range-job is created with.
#[derive(Clone, Copy, Debug)]
pub struct JobConfig {
    pub begin: usize,
    pub end: usize,
    pub batch_size: usize,
}

impl JobConfig {
    pub fn whole(end: usize, batch_size: usize) -> Self {
        JobConfig { begin: 0, end, batch_size }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }
}

/// Closures a job body can call back into: this is how a chunk indexes
/// into the caller's range function.
pub trait RangeFn: Fn(usize) + Send + Sync {}
impl<F: Fn(usize) + Send + Sync> RangeFn for F {}

/// A single scheduled unit of work.
///
/// Allocated from and returned to [`Pool`]; `begin`/`end`/`batch_size` are
/// mutated in place by [`split`](Self::split) as the owning worker chunks
/// the range. `children` is the only field another thread ever touches.
pub struct Job {
    body: *const (dyn RangeFn + 'static),
    begin: usize,
    end: usize,
    batch_size: usize,
    children: AtomicUsize,
    parent: *mut Job,
    /// True iff `body` was boxed for this job specifically (via
    /// [`Pool::create`]) rather than inherited from a parent via
    /// [`split`](Self::split). The job whose `owns_body` is true is the
    /// one that frees it, once its own join counter reaches zero —
    /// independent of whether it has a parent, since an externally
    /// created job can be handed a parent belonging to an entirely
    /// different tree with its own, distinct body.
    owns_body: bool,
}

// Safety: a `Job` is only ever touched through `Pool`/`Worker`, which
// enforce single-owner-at-a-time access to everything except `children`.
unsafe impl Send for Job {}

impl Job {
    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// True while `len() > batch_size`; the worker loop keeps calling
    /// [`split`](Self::split) until this is false.
    #[inline]
    pub fn needs_split(&self) -> bool {
        self.len() > self.batch_size
    }

    /// Splits this job in half, shrinking `self` to the lower half and
    /// returning a freshly allocated job covering the upper half, with
    /// `self` (identified by `this`, its own pool address) as parent.
    /// `alloc_raw` adds one join unit to `self` for the new child.
    pub fn split(&mut self, pool: &Pool, this: *mut Job) -> *mut Job {
        debug_assert!(self.needs_split());
        let mid = self.begin + self.len() / 2;
        let right_begin = mid;
        let right_end = self.end;
        self.end = mid;

        pool.alloc_raw(self.body, right_begin, right_end, self.batch_size, this, false)
    }

    /// Runs the job body over `[begin, end)`.
    fn call(&self) {
        let body = unsafe { &*self.body };
        for i in self.begin..self.end {
            body(i);
        }
    }

    /// Checks in one join unit (either "self just finished" or "a child
    /// just finished"). Returns `true` exactly once, when the count
    /// transitions to zero — meaning every unit, self and all
    /// descendants, has completed and this job may now be released.
    fn check_in(&self) -> bool {
        self.children.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[inline]
    pub fn parent(&self) -> *mut Job {
        self.parent
    }
}

/// Per-thread free-list allocator for [`Job`]s.
///
/// Grounded in the "thread-local, refilled lazily, bounded only by
/// steady-state demand" object pool design: allocation pulls from a local
/// free list and falls back to a fresh heap allocation; release always
/// returns to the *releasing* thread's pool, never the pool of origin,
/// which is what makes cross-thread job hand-off (stealing) safe without
/// any pool-side synchronization.
pub struct Pool {
    free: RefCell<Vec<*mut Job>>,
}

impl Pool {
    pub fn new() -> Self {
        Pool { free: RefCell::new(Vec::new()) }
    }

    /// Allocates a new job from this pool. Matches the external
    /// `job::create(fn, {begin, end, batch_size}, parent?) -> job*`
    /// contract (§6): on `Some(parent)`, the parent's join counter is
    /// atomically incremented before this returns, so the parent cannot
    /// be considered complete (and resumed/released) until this job
    /// also checks in.
    pub fn create<F>(&self, body: F, config: JobConfig, parent: Option<*mut Job>) -> *mut Job
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let body: *const (dyn RangeFn + 'static) = Box::into_raw(Box::new(body));
        let parent = parent.unwrap_or(std::ptr::null_mut());
        self.alloc_raw(body, config.begin, config.end, config.batch_size.max(1), parent, true)
    }

    fn alloc_raw(
        &self,
        body: *const (dyn RangeFn + 'static),
        begin: usize,
        end: usize,
        batch_size: usize,
        parent: *mut Job,
        owns_body: bool,
    ) -> *mut Job {
        if !parent.is_null() {
            unsafe { (*parent).children.fetch_add(1, Ordering::AcqRel) };
        }

        let job = Job {
            body,
            begin,
            end,
            batch_size,
            children: AtomicUsize::new(1),
            parent,
            owns_body,
        };

        if let Some(slot) = self.free.borrow_mut().pop() {
            unsafe {
                std::ptr::write(slot, job);
            }
            slot
        } else {
            Box::into_raw(Box::new(job))
        }
    }

    /// Returns `job` to this (the calling thread's) pool.
    fn release(&self, job: *mut Job) {
        self.free.borrow_mut().push(job);
    }

    /// Processes one job dispatch: splits `job` while it exceeds its
    /// batch size (each right half delivered to `sink`), runs `job`'s own
    /// remaining slice exactly once, then checks `job`'s own unit in and
    /// follows the completion chain up through however many ancestors
    /// that check-in makes newly eligible — the "no deque round-trip"
    /// tail-call continuation from §4.4/§4.5.
    ///
    /// Every `*mut Job` this ever sees — `job` itself and anything
    /// previously handed to `sink` — must be dispatched through this
    /// method exactly once.
    pub fn run_to_completion<S: FnMut(*mut Job)>(&self, job: *mut Job, mut sink: S) {
        self.chunk_into(job, &mut sink);
        unsafe { (*job).call() };
        self.finish(job);
    }

    fn finish(&self, mut job: *mut Job) {
        loop {
            if !unsafe { (*job).check_in() } {
                return;
            }

            let parent = unsafe { (*job).parent() };
            let owns_body = unsafe { (*job).owns_body };
            let body = unsafe { (*job).body };
            self.release(job);

            if owns_body {
                // This job's own join counter reaching zero means its own
                // slice and every descendant split off from it (which all
                // share this body) have finished, so the body is safe to
                // drop now regardless of whether this job also has a
                // parent of its own.
                unsafe { drop(Box::from_raw(body as *mut (dyn RangeFn + 'static))) };
            }

            if parent.is_null() {
                return;
            }

            job = parent;
        }
    }

    fn chunk_into<S: FnMut(*mut Job)>(&self, job: *mut Job, sink: &mut S) {
        while unsafe { (*job).needs_split() } {
            let right = unsafe { (*job).split(self, job) };
            sink(right);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for job in self.free.borrow_mut().drain(..) {
            unsafe {
                drop(Box::from_raw(job));
            }
        }
    }
}

thread_local! {
    /// Backs [`create`] for threads that are not a scheduler worker (the
    /// calling thread still gets a thread-local pool per §9's "object
    /// pool is thread-local" rule; it is just not the pool any worker
    /// dispatch loop drains from).
    static SCRATCH_POOL: Pool = Pool::new();
}

/// The crate's external job-creation entry point (§6:
/// `job::create(fn, {begin, end, batch_size}, parent?) -> job*`).
/// Allocates from the calling thread's pool — the current worker's own
/// pool if called from inside a job or otherwise on a worker thread,
/// or a dedicated thread-local scratch pool otherwise — and, if
/// `parent` is given, atomically increments its join counter before
/// returning.
pub fn create<F>(body: F, config: JobConfig, parent: Option<*mut Job>) -> *mut Job
where
    F: Fn(usize) + Send + Sync + 'static,
{
    match Worker::current() {
        Some(worker) => worker.pool().create(body, config, parent),
        None => SCRATCH_POOL.with(|pool| pool.create(body, config, parent)),
    }
}
