// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Public entry points: `Scheduler` (owns the loop thread) and
//! `SchedulerHandle` (cheap, cloneable submission side).

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::SchedulerConfig;
use crate::error::{panic_message, SchedError};
use crate::handoff::{self, Handoff, HandoffWaiter};
use crate::interest::Interest;
use crate::job::{Job, JobKey};
use crate::reactor::queue::{Registration, Request, SubmissionQueue};
use crate::reactor::Reactor;
use crate::stats::{Counters, SchedulerStats};
use crate::timed::TimedJob;

/// State shared between the loop and every handle.
pub(crate) struct Shared {
    pub queue: SubmissionQueue,
    pub stats: Counters,
    next_key: AtomicU64,
}

impl Shared {
    pub fn new(queue: SubmissionQueue) -> Self {
        Self {
            queue,
            stats: Counters::default(),
            next_key: AtomicU64::new(1),
        }
    }

    fn next_key(&self) -> JobKey {
        JobKey::new(self.next_key.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a job listens: a channel with an interest mask, a deadline, or both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Target {
    channel: Option<(RawFd, Interest)>,
    deadline: Option<Instant>,
}

impl Target {
    /// Readiness on `channel`. The caller keeps the handle open for as long
    /// as the job is registered.
    pub fn channel(channel: &impl AsRawFd, interest: Interest) -> Self {
        Self::raw_channel(channel.as_raw_fd(), interest)
    }

    pub fn raw_channel(fd: RawFd, interest: Interest) -> Self {
        Self {
            channel: Some((fd, interest)),
            deadline: None,
        }
    }

    /// Absolute deadline only.
    pub fn deadline(at: Instant) -> Self {
        Self {
            channel: None,
            deadline: Some(at),
        }
    }

    /// Deadline `after` from now. Durations too large for an `Instant`
    /// saturate far in the future.
    pub fn after(after: Duration) -> Self {
        Self::deadline(deadline_after(Instant::now(), after))
    }

    pub fn with_deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(at);
        self
    }

    pub fn with_timeout(self, after: Duration) -> Self {
        self.with_deadline(deadline_after(Instant::now(), after))
    }

    fn validate(&self) -> Result<(), SchedError> {
        match self.channel {
            None if self.deadline.is_none() => Err(SchedError::MissingTarget),
            None => Ok(()),
            Some((_, interest)) if interest.is_empty() => Err(SchedError::EmptyInterest),
            Some((fd, _)) => check_fd(fd),
        }
    }
}

/// Longest wait a relative deadline resolves to.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `from + after`, saturating instead of overflowing.
pub(crate) fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after.min(FAR_FUTURE)).unwrap_or(from)
}

/// The fd must be open and pollable. epoll refuses regular files and
/// directories with EPERM, so those are turned away here.
fn check_fd(fd: RawFd) -> Result<(), SchedError> {
    if fd < 0 {
        return Err(SchedError::InvalidChannel {
            fd,
            source: io::Error::from_raw_os_error(libc::EBADF),
        });
    }
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(SchedError::InvalidChannel {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    let kind = st.st_mode & libc::S_IFMT;
    if kind == libc::S_IFREG || kind == libc::S_IFDIR {
        return Err(SchedError::InvalidChannel {
            fd,
            source: io::Error::from_raw_os_error(libc::EPERM),
        });
    }
    Ok(())
}

/// Submission side of a scheduler. Clone freely; every method is safe to
/// call from any thread, including from inside a job.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Register `job`. The returned key identifies this registration for
    /// `cancel`, `update_interest` and `fire`.
    pub fn register(&self, job: impl Job, target: Target) -> Result<JobKey, SchedError> {
        self.register_boxed(Box::new(job), target)
    }

    pub fn register_boxed(&self, job: Box<dyn Job>, target: Target) -> Result<JobKey, SchedError> {
        self.submit(job, target, None)
    }

    /// Register `job` with a handoff. The waiter resolves when the job fires
    /// the handoff, or with `Abandoned` if the job terminates without firing.
    pub fn register_with_handoff(
        &self,
        job: impl Job,
        target: Target,
    ) -> Result<(JobKey, HandoffWaiter), SchedError> {
        let (handoff, waiter) = handoff::handoff();
        let key = self.submit(Box::new(job), target, Some(handoff))?;
        Ok((key, waiter))
    }

    /// Register a deadline-only job.
    pub fn register_timer(&self, job: impl TimedJob, deadline: Instant) -> Result<JobKey, SchedError> {
        self.register(job, Target::deadline(deadline))
    }

    fn submit(
        &self,
        job: Box<dyn Job>,
        target: Target,
        handoff: Option<Handoff>,
    ) -> Result<JobKey, SchedError> {
        target.validate()?;
        let key = self.shared.next_key();
        self.shared.stats.submitted();
        let pushed = self.shared.queue.push(Request::Register(Box::new(Registration {
            key,
            job,
            channel: target.channel,
            deadline: target.deadline,
            handoff,
        })));
        if let Err(e) = pushed {
            self.shared.stats.settled();
            return Err(e);
        }
        Ok(key)
    }

    /// Cancel a registration. `cancelled` runs once if the job is still
    /// registered when the loop sees the request; otherwise nothing happens.
    pub fn cancel(&self, key: JobKey) {
        if self.shared.queue.push(Request::Cancel(key)).is_err() {
            debug!(key = %key, "cancel after scheduler stopped");
        }
    }

    /// Replace the interest mask of a channel job.
    pub fn update_interest(&self, key: JobKey, interest: Interest) -> Result<(), SchedError> {
        if interest.is_empty() {
            return Err(SchedError::EmptyInterest);
        }
        self.shared.queue.push(Request::UpdateInterest(key, interest))
    }

    /// Invoke a job from the loop with an empty ready set.
    pub fn fire(&self, key: JobKey) -> Result<(), SchedError> {
        self.shared.queue.push(Request::Fire(key))
    }

    /// Ask the loop to stop. Returns immediately.
    pub fn shutdown(&self) {
        let _ = self.shared.queue.push(Request::Shutdown);
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.snapshot()
    }

    /// No registered jobs and nothing queued.
    pub fn is_idle(&self) -> bool {
        self.shared.stats.is_idle()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.is_closed()
    }
}

/// A reactor running on its own named thread.
///
/// Dropping the scheduler shuts it down and joins the thread.
pub struct Scheduler {
    handle: SchedulerHandle,
    thread: Mutex<Option<thread::JoinHandle<Result<(), SchedError>>>>,
}

impl Scheduler {
    pub fn start(config: SchedulerConfig) -> Result<Self, SchedError> {
        let mut reactor = Reactor::new(&config)?;
        let handle = reactor.handle();
        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || reactor.run())
            .map_err(SchedError::Setup)?;
        Ok(Self {
            handle,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stop the loop and wait for it. Surfaces a poll failure or a panic of
    /// the loop thread.
    pub fn shutdown(&self) -> Result<(), SchedError> {
        self.handle.shutdown();
        self.join()
    }

    /// Wait for the loop thread to exit. Later calls return `Ok(())`.
    pub fn join(&self) -> Result<(), SchedError> {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(thread) = thread else {
            return Ok(());
        };
        if thread.thread().id() == thread::current().id() {
            // Joined from a job on the loop thread; the loop exits on its own.
            return Ok(());
        }
        match thread.join() {
            Ok(result) => result,
            Err(payload) => Err(SchedError::LoopPanicked(panic_message(payload))),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            debug!(error = %e, "scheduler stopped with an error");
        }
    }
}
