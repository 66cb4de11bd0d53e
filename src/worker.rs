//! A single worker thread: its local deque, its view of the roster, and
//! the dispatch loop described in §4.5 (local take → steal → global pop
//! → backoff ladder → block).

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::backoff::{Backoff, Step};
use crate::chase_lev::ChaseLevDeque;
use crate::global_queue::GlobalQueue;
use crate::job::{Job, Pool};

/// One entry in the scheduler's worker roster: the pieces every other
/// worker (and the scheduler itself) may reach across threads. The
/// thread-local pieces (the job pool, the RNG) live in [`Worker`]
/// instead, installed on thread entry.
pub struct Roster {
    pub local: ChaseLevDeque<*mut Job>,
    active: AtomicBool,
}

impl Roster {
    pub fn new(local_queue_size: usize) -> Self {
        Roster {
            local: ChaseLevDeque::new(local_queue_size),
            active: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

/// The thread-local state installed for the lifetime of a worker thread.
/// Reachable from anywhere on that thread via [`Worker::current`].
pub struct Worker {
    id: usize,
    roster: Arc<[Roster]>,
    global: Arc<GlobalQueue<*mut Job>>,
    pool: Pool,
    rng: XorShift64Star,
}

thread_local! {
    static CURRENT: Cell<*const Worker> = Cell::new(std::ptr::null());
}

impl Worker {
    fn new(id: usize, roster: Arc<[Roster]>, global: Arc<GlobalQueue<*mut Job>>) -> Self {
        Worker {
            id,
            roster,
            global,
            pool: Pool::new(),
            rng: XorShift64Star::new(),
        }
    }

    /// Returns the calling thread's worker, or `None` if the calling
    /// thread is not a worker of any scheduler.
    pub fn current() -> Option<&'static Worker> {
        let ptr = CURRENT.with(|c| c.get());
        if ptr.is_null() {
            None
        } else {
            // Safety: only cleared (back to null) after the installing
            // thread's main loop returns, and the `Worker` it points to
            // outlives that loop (it's a local on the same stack frame).
            Some(unsafe { &*ptr })
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// This worker's thread-local job pool, for callers (e.g.
    /// [`crate::scheduler::Scheduler::submit_range`]) that want to
    /// allocate a job on the calling worker's own free list rather than
    /// a scratch one.
    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Pushes a job onto this worker's own local deque, falling back to
    /// the global queue (blocking) if the local deque is full — the
    /// `scheduler::push` behavior for calls made from inside a job.
    pub fn push(&self, job: *mut Job) {
        if !self.roster[self.id].local.push(job) {
            let _ = self.global.blocking_push(job);
        }
    }

    fn roster(&self) -> &[Roster] {
        &self.roster
    }

    /// Runs `job` to completion (chunking, executing, following the
    /// continuation chain), spilling any split-off children onto this
    /// worker's own local deque.
    fn dispatch(&self, job: *mut Job) {
        self.pool.run_to_completion(job, |child| self.push(child));
    }

    /// The per-worker dispatch loop from §4.5. Installs `self` into
    /// thread-local storage for the duration, and returns once the
    /// roster entry's `active` flag has been cleared and no further work
    /// remains reachable.
    fn run(&self) {
        CURRENT.with(|c| {
            assert!(c.get().is_null(), "a worker is already installed on this thread");
            c.set(self as *const Worker);
        });
        debug!("worker {} started", self.id);

        let mut backoff = Backoff::new();
        let me = &self.roster[self.id];

        loop {
            if let Some(job) = me.local.take() {
                backoff.reset();
                self.dispatch(job);
                continue;
            }

            if let Some(job) = self.steal() {
                backoff.reset();
                self.dispatch(job);
                continue;
            }

            if let Some(job) = self.global.pop() {
                backoff.reset();
                self.dispatch(job);
                continue;
            }

            if !me.is_active() {
                debug!("worker {} stopping", self.id);
                return;
            }

            match backoff.miss() {
                Step::Spin | Step::Yield => {}
                Step::Park => match self.global.blocking_pop() {
                    Some(job) => {
                        backoff.reset();
                        self.dispatch(job);
                    }
                    None => {
                        debug!("worker {} stopping, global queue killed", self.id);
                        return; // global queue killed and drained
                    }
                },
            }
        }

        // unreachable, loop only exits via `return` above
    }

    /// Attempts to steal from a single randomly chosen peer. The spec's
    /// `offset = rand() mod (N-1) + 1` formulation is equivalent to
    /// picking a uniformly random peer index other than our own, which
    /// is what this does directly.
    fn steal(&self) -> Option<*mut Job> {
        let roster = self.roster();
        let n = roster.len();
        if n <= 1 {
            return None;
        }

        let offset = self.rng.next_usize(n - 1) + 1;
        let victim = (self.id + offset) % n;
        roster[victim].local.steal()
    }

    /// Drains and runs every job left in the global queue on the calling
    /// thread, following each one's continuation chain — used by
    /// `Scheduler::stop(flush = true)`.
    pub(crate) fn drain_global(global: &GlobalQueue<*mut Job>, pool: &Pool) {
        while let Some(job) = global.pop() {
            pool.run_to_completion(job, |child| {
                // No worker identity on this thread; park split-off
                // children straight back on the global queue.
                let _ = global.push(child);
            });
        }
    }
}

/// Spawns the OS thread backing roster entry `id` and runs its dispatch
/// loop until shutdown. Returns the `JoinHandle`.
pub fn spawn(
    id: usize,
    roster: Arc<[Roster]>,
    global: Arc<GlobalQueue<*mut Job>>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    roster[id].set_active(true);
    let handle = std::thread::Builder::new()
        .name(format!("scheduler-worker-{}", id))
        .spawn(move || {
            let worker = Worker::new(id, roster, global);
            worker.run();
        })?;
    info!("spawned worker {}", id);
    Ok(handle)
}

/// Xorshift64* RNG seeded from a monotonic counter hashed through
/// `DefaultHasher` — avoids pulling in a `rand` dependency purely for
/// picking a steal victim.
struct XorShift64Star {
    state: Cell<u64>,
}

impl XorShift64Star {
    fn new() -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let mut seed = 0u64;
        while seed == 0 {
            let mut hasher = DefaultHasher::new();
            hasher.write_usize(COUNTER.fetch_add(1, Ordering::Relaxed));
            seed = hasher.finish();
        }

        XorShift64Star { state: Cell::new(seed) }
    }

    fn next(&self) -> u64 {
        let mut x = self.state.get();
        debug_assert_ne!(x, 0);
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn next_usize(&self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobConfig;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::sync::Arc;

    #[test]
    fn xorshift_never_settles_on_zero() {
        let rng = XorShift64Star::new();
        for _ in 0..10_000 {
            assert_ne!(rng.next(), 0);
        }
    }

    #[test]
    fn current_is_none_off_worker_thread() {
        assert!(Worker::current().is_none());
    }

    #[test]
    fn drain_global_runs_every_spilled_job() {
        let pool = Pool::new();
        let global: GlobalQueue<*mut Job> = GlobalQueue::new(64);
        let counter = Arc::new(Counter::new(0));
        let c = counter.clone();

        let job = pool.create(move |_| { c.fetch_add(1, Ordering::Relaxed); }, JobConfig::whole(32, 1), None);
        global.push(job).unwrap();

        Worker::drain_global(&global, &pool);
        assert_eq!(counter.load(Ordering::Relaxed), 32);
    }
}
