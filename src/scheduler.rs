//! Scheduler construction, lifecycle (start/push/stop) and configuration.
//!
//! Mirrors the `Registry`/`Scheduler` lifecycle the pack's rayon-derived
//! sources use (spawn one thread per roster slot, track readiness with a
//! latch, tear down by flipping a flag and joining), generalized to the
//! job model in [`crate::job`] and the two queue types in
//! [`crate::chase_lev`]/[`crate::global_queue`].

use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::errors::{Error, Result};
use crate::global_queue::GlobalQueue;
use crate::job::{Job, JobConfig, Pool};
use crate::worker::{self, Roster, Worker};

/// Construction-time options. Every capacity here must be a power of
/// two; violating that is reported as
/// [`Error::CapacityMisconfigured`](crate::errors::Error) rather than a
/// panic, since it is the one user-facing mistake the scheduler can
/// detect before spawning a single thread.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Number of worker threads. Defaults to [`num_cpus::get`].
    pub worker_count: usize,
    /// Capacity of each worker's local deque. Must be a power of two.
    pub local_queue_size: usize,
    /// Maximum index span a range-job executes inline before splitting
    /// further (§4.4).
    pub local_batch_size: usize,
    /// Capacity of the shared global queue. Must be a power of two.
    pub global_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let worker_count = num_cpus::get().max(1);
        Config {
            worker_count,
            local_queue_size: 4096,
            local_batch_size: 256,
            global_queue_size: (4096 * worker_count).next_power_of_two(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::CapacityMisconfigured("worker_count", self.worker_count));
        }
        if !self.local_queue_size.is_power_of_two() {
            return Err(Error::CapacityMisconfigured("local_queue_size", self.local_queue_size));
        }
        if !self.global_queue_size.is_power_of_two() {
            return Err(Error::CapacityMisconfigured("global_queue_size", self.global_queue_size));
        }
        if self.local_batch_size == 0 {
            return Err(Error::CapacityMisconfigured("local_batch_size", self.local_batch_size));
        }
        Ok(())
    }
}

/// Owns the worker roster and the global queue for the lifetime of the
/// process (or until [`stop`](Self::stop)). Immovable after
/// [`start`](Self::start): workers hold references into it for as long
/// as they run.
pub struct Scheduler {
    config: Config,
    roster: Arc<[Roster]>,
    global: Arc<GlobalQueue<*mut Job>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Builds a scheduler with `config`. No threads are spawned yet;
    /// call [`start`](Self::start) to do that. Fails only on an invalid
    /// configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let roster: Arc<[Roster]> = (0..config.worker_count)
            .map(|_| Roster::new(config.local_queue_size))
            .collect::<Vec<_>>()
            .into();

        let global = Arc::new(GlobalQueue::new(config.global_queue_size));

        Ok(Scheduler {
            config,
            roster,
            global,
            handles: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawns every worker's thread. Callers must call this at most once
    /// per scheduler — it is not idempotent, matching §6. If any thread
    /// fails to spawn, every worker started so far is stopped, the
    /// global queue is reset to a fresh `Alive` instance, and the
    /// originating I/O error is surfaced.
    pub fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().unwrap();
        debug_assert!(handles.is_empty(), "Scheduler::start called more than once");

        for id in 0..self.roster.len() {
            match worker::spawn(id, self.roster.clone(), self.global.clone()) {
                Ok(handle) => handles.push(handle),
                Err(io_err) => {
                    warn!("worker {} failed to spawn, rolling back {} started workers: {}", id, handles.len(), io_err);

                    self.global.kill();
                    for roster in self.roster.iter() {
                        roster.set_active(false);
                    }
                    for handle in handles.drain(..) {
                        let _ = handle.join();
                    }
                    self.global.revive(self.config.global_queue_size);

                    return Err(Error::Alloc("worker thread", io_err));
                }
            }
        }

        info!("scheduler started with {} workers", self.roster.len());
        Ok(())
    }

    /// Enqueues `job` for asynchronous execution. If the calling thread
    /// is itself a worker of this scheduler, the job lands on that
    /// worker's local deque (falling back to the global queue if the
    /// local deque is full); otherwise it goes straight to the global
    /// queue, blocking until there is room or the queue is killed.
    pub fn push(&self, job: *mut Job) {
        if let Some(worker) = Worker::current() {
            worker.push(job);
        } else {
            let _ = self.global.blocking_push(job);
        }
    }

    /// Convenience wrapper around [`push`](Self::push) for range-jobs:
    /// allocates the job (with no parent) via [`crate::job::create`] and
    /// submits it.
    pub fn submit_range<F>(&self, body: F, config: JobConfig)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let job = crate::job::create(body, config, None);
        self.push(job);
    }

    /// Signals shutdown: kills the global queue (unblocking every
    /// `blocking_*` caller), clears every worker's `active` flag, and
    /// joins every worker thread. If `flush` is true, any jobs still in
    /// the global queue are drained and run to completion on the
    /// calling thread first.
    pub fn stop(&self, flush: bool) {
        info!("stopping scheduler (flush = {})", flush);
        self.global.kill();
        for roster in self.roster.iter() {
            roster.set_active(false);
        }

        let handles = { self.handles.lock().unwrap().drain(..).collect::<Vec<_>>() };
        for handle in handles {
            let _ = handle.join();
        }

        if flush {
            let pool = Pool::new();
            Worker::drain_global(&self.global, &pool);
        }
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.roster.len()
    }
}
