//! A work-stealing task scheduler for short-lived, user-submitted jobs,
//! plus a range-splitting job primitive layered on top of it.
//!
//! The three load-bearing pieces are a bounded Chase-Lev work-stealing
//! deque per worker ([`chase_lev`]), a bounded Vyukov MPMC queue shared
//! by every worker and external submitters ([`global_queue`]), and an
//! epoch-based reclamation scheme ([`epoch`]) that lets a stealer
//! dereference a deque slot without an atomic refcount on every access.
//! [`worker`] and [`scheduler`] compose those with the job/range model
//! in [`job`].

pub mod backoff;
pub mod chase_lev;
pub mod epoch;
pub mod errors;
pub mod global_queue;
pub mod job;
pub mod scheduler;
pub mod worker;

pub use self::errors::{Error, Result};
pub use self::job::{Job, JobConfig, Pool};
pub use self::scheduler::{Config, Scheduler};
pub use self::worker::Worker;
