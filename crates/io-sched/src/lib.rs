// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-blocking I/O and timer dispatch.
//!
//! One loop thread multiplexes readiness across many file descriptors with
//! epoll and fires deadline callbacks, while any number of other threads
//! submit, cancel and re-target work through a `SchedulerHandle`.
//!
//! Components:
//! - job/timed: the `Job` contract and its deadline-only `TimedJob` form
//! - reactor: the loop and its timer index, channel registry and queue
//! - scheduler: `Scheduler` (loop thread) and `SchedulerHandle`
//! - handoff: single-use signal for call-and-wait producers
//! - config/stats: `SchedulerConfig` and loop counters
//!
//! Linux only.

pub mod config;
pub mod error;
pub mod handoff;
pub mod interest;
pub mod job;
pub mod reactor;
pub mod scheduler;
pub mod stats;
pub mod timed;

pub use config::SchedulerConfig;
pub use error::{ConfigError, HandoffError, JobError, SchedError};
pub use handoff::{Handoff, HandoffWaiter};
pub use interest::Interest;
pub use job::{Channel, Job, JobKey, Outcome};
pub use reactor::{JobSnapshot, Reactor};
pub use scheduler::{Scheduler, SchedulerHandle, Target};
pub use stats::SchedulerStats;
pub use timed::{CancelToken, OnDeadline, Periodic, TimedJob};
