// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The scheduler loop.
//!
//! One `Reactor` owns the channel registry, the timer index and every
//! registered job. Each `turn` runs one iteration:
//!
//! 1. compute the wait bound from the earliest deadline
//! 2. `epoll_wait`
//! 3. apply queued requests in submission order
//! 4. expire every job whose deadline is at or before now, except jobs whose
//!    channel reported matching readiness in this wait
//! 5. dispatch readiness to `Job::invoke`
//!
//! Readiness wins over a deadline that elapses in the same iteration. A job
//! installed in step 3 sees no readiness from step 2: the wait ran before it
//! owned the fd, and level-triggered epoll reports the fd again next time.

mod poller;
pub(crate) mod queue;
mod registry;
mod timer;

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::SchedulerConfig;
use crate::error::{panic_message, JobError, SchedError};
use crate::handoff::Handoff;
use crate::interest::Interest;
use crate::job::{Channel, Job, JobKey, Outcome};
use crate::scheduler::{SchedulerHandle, Shared};

use self::poller::{Events, Poller, Waker, WAKE_TOKEN};
use self::queue::{Registration, Request, SubmissionQueue};
use self::registry::ChannelRegistry;
use self::timer::TimerIndex;

struct Entry {
    job: Box<dyn Job>,
    channel: Option<RawFd>,
    interest: Interest,
    deadline: Option<Instant>,
    handoff: Option<Handoff>,
}

/// Diagnostic view of one registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub key: JobKey,
    pub description: String,
    pub channel: Option<RawFd>,
    pub interest: Interest,
    pub deadline: Option<Instant>,
}

/// Single-threaded readiness and deadline dispatcher.
///
/// Drive it with `run` on a dedicated thread (what `Scheduler::start` does)
/// or call `turn` from a thread of your own. Other threads reach it only
/// through a `SchedulerHandle`.
pub struct Reactor {
    registry: ChannelRegistry,
    timers: TimerIndex,
    jobs: HashMap<JobKey, Entry>,
    shared: Arc<Shared>,
    events: Events,
    /// Channel events from the last wait, in kernel order.
    ready: Vec<(RawFd, u32)>,
    /// Jobs installed by the current pass.
    fresh: HashSet<JobKey>,
    max_poll_interval: Option<Duration>,
    stopping: bool,
    closed: bool,
}

impl Reactor {
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedError> {
        config.validate()?;
        let poller = Poller::new().map_err(SchedError::Setup)?;
        let waker = Waker::new().map_err(SchedError::Setup)?;
        poller.add_waker(&waker).map_err(SchedError::Setup)?;
        let queue = SubmissionQueue::new(config.queue_capacity, waker);

        Ok(Self {
            registry: ChannelRegistry::new(poller),
            timers: TimerIndex::new(),
            jobs: HashMap::new(),
            shared: Arc::new(Shared::new(queue)),
            events: Events::with_capacity(config.max_events),
            ready: Vec::with_capacity(config.max_events),
            fresh: HashSet::new(),
            max_poll_interval: config.max_poll_interval(),
            stopping: false,
            closed: false,
        })
    }

    /// A handle for submitting work from any thread.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(self.shared.clone())
    }

    /// Run iterations until shutdown or a poll failure.
    pub fn run(&mut self) -> Result<(), SchedError> {
        info!(jobs = self.jobs.len(), "scheduler loop started");
        while !self.closed {
            self.turn(None)?;
        }
        Ok(())
    }

    /// Run one iteration, waiting at most `timeout` (and never past the
    /// earliest deadline). `None` waits until readiness, a submission or
    /// the next deadline, bounded by `max_poll_interval` when configured.
    ///
    /// Once a shutdown request is seen the iteration finishes and the
    /// reactor closes; further turns return `SchedError::Stopped`.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<(), SchedError> {
        if self.closed {
            return Err(SchedError::Stopped);
        }

        let timeout = self.poll_timeout(timeout, Instant::now());
        trace!(
            ?timeout,
            jobs = self.jobs.len(),
            channels = self.registry.len(),
            timers = self.timers.len(),
            "waiting"
        );
        if let Err(e) = self.registry.wait(&mut self.events, timeout) {
            error!(error = %e, jobs = self.jobs.len(), "epoll_wait failed, stopping loop");
            self.close();
            return Err(SchedError::Poll(e));
        }

        if self.events.is_empty() {
            trace!("wait timed out");
        }
        let mut woken = false;
        self.ready.clear();
        for (token, bits) in self.events.iter() {
            if token == WAKE_TOKEN {
                woken = true;
            } else {
                self.ready.push((token as RawFd, bits));
            }
        }

        let waker = self.shared.queue.waker();
        if woken {
            waker.reset();
        }
        waker.clear();
        self.fresh.clear();
        for request in self.shared.queue.drain() {
            self.apply(request);
        }

        self.drain_expired(Instant::now());
        self.drain_ready();

        self.shared.stats.iteration();

        if self.stopping {
            self.close();
        }
        Ok(())
    }

    fn poll_timeout(&self, requested: Option<Duration>, now: Instant) -> Option<Duration> {
        if self.stopping {
            return Some(Duration::ZERO);
        }
        let bound = min_timeout(requested, self.max_poll_interval);
        let until_deadline = self
            .timers
            .peek()
            .map(|(deadline, _)| deadline.saturating_duration_since(now));
        min_timeout(bound, until_deadline)
    }

    fn apply(&mut self, request: Request) {
        match request {
            Request::Register(registration) => {
                self.install(*registration);
                self.shared.stats.settled();
            }
            Request::Cancel(key) => match self.remove_entry(key) {
                Some(mut entry) => {
                    debug!(key = %key, job = %entry.job.describe(), "cancelled by request");
                    self.notify_cancelled(key, entry.job.as_mut());
                }
                None => trace!(key = %key, "cancel for a job that already terminated"),
            },
            Request::UpdateInterest(key, interest) => {
                if let Err(e) = self.set_interest(key, interest) {
                    warn!(key = %key, error = %e, "interest update rejected");
                    if let Some(mut entry) = self.remove_entry(key) {
                        self.notify_cancelled(key, entry.job.as_mut());
                    }
                }
            }
            Request::Fire(key) => {
                if self.jobs.contains_key(&key) {
                    self.dispatch(key, Interest::empty());
                } else {
                    trace!(key = %key, "fire for a job that already terminated");
                }
            }
            Request::Shutdown => {
                if !self.stopping {
                    info!(jobs = self.jobs.len(), "shutdown requested");
                }
                self.stopping = true;
            }
        }
    }

    fn install(&mut self, registration: Registration) {
        let Registration {
            key,
            mut job,
            channel,
            deadline,
            handoff,
        } = registration;

        let mut fd = None;
        let mut interest = Interest::empty();
        if let Some((raw, mask)) = channel {
            match self.registry.insert(raw, key, mask) {
                Ok(displaced) => {
                    if let Some(old) = displaced {
                        self.displace(old, raw);
                    }
                    fd = Some(raw);
                    interest = mask;
                }
                Err(e) => {
                    warn!(
                        key = %key,
                        fd = raw,
                        error = %e,
                        job = %job.describe(),
                        "channel registration rejected"
                    );
                    self.notify_cancelled(key, job.as_mut());
                    return;
                }
            }
        }
        if let Some(at) = deadline {
            self.timers.insert(key, at);
        }

        debug!(
            key = %key,
            job = %job.describe(),
            fd = ?fd,
            interest = %interest,
            has_deadline = deadline.is_some(),
            "registered"
        );
        self.jobs.insert(
            key,
            Entry {
                job,
                channel: fd,
                interest,
                deadline,
                handoff,
            },
        );
        self.fresh.insert(key);
        self.shared.stats.set_active(self.jobs.len());
        self.shared.stats.registered();
    }

    /// The registry already points `fd` at the new owner; retire the old one.
    fn displace(&mut self, old: JobKey, fd: RawFd) {
        if let Some(mut entry) = self.jobs.remove(&old) {
            self.timers.remove(old);
            self.shared.stats.set_active(self.jobs.len());
            debug!(key = %old, fd, job = %entry.job.describe(), "displaced by a new registration");
            self.notify_cancelled(old, entry.job.as_mut());
        }
    }

    /// On error the job is left registered with its old mask; the caller
    /// decides how it terminates.
    fn set_interest(&mut self, key: JobKey, interest: Interest) -> io::Result<()> {
        let Some(entry) = self.jobs.get_mut(&key) else {
            trace!(key = %key, "interest update for a job that already terminated");
            return Ok(());
        };
        let Some(fd) = entry.channel else {
            debug!(key = %key, "interest update ignored, job has no channel");
            return Ok(());
        };
        if entry.interest == interest {
            return Ok(());
        }
        self.registry.update(fd, interest)?;
        entry.interest = interest;
        Ok(())
    }

    fn drain_expired(&mut self, now: Instant) {
        let mut deferred = Vec::new();
        while let Some((deadline, key)) = self.timers.pop_expired(now) {
            let serviced_by_readiness = match self.jobs.get(&key) {
                Some(entry) => {
                    !self.fresh.contains(&key)
                        && entry
                            .channel
                            .is_some_and(|fd| self.reported_ready(fd, entry.interest))
                }
                None => continue,
            };
            if serviced_by_readiness {
                deferred.push((key, deadline));
                continue;
            }
            if let Some(mut entry) = self.remove_entry(key) {
                debug!(key = %key, job = %entry.job.describe(), "deadline expired");
                self.shared.stats.expired();
                self.notify_cancelled(key, entry.job.as_mut());
            }
        }
        // Readiness goes first; the deadline still stands if the job rearms.
        for (key, deadline) in deferred {
            self.timers.insert(key, deadline);
        }
    }

    fn reported_ready(&self, fd: RawFd, interest: Interest) -> bool {
        self.ready.iter().any(|&(ready_fd, bits)| {
            ready_fd == fd && !Interest::from_epoll_events(bits, interest).is_empty()
        })
    }

    fn drain_ready(&mut self) {
        let ready = std::mem::take(&mut self.ready);
        for &(fd, bits) in &ready {
            // Requests in this pass may have replaced the owner. A new owner
            // waits for the next wait; the event may belong to the file the
            // fd number referred to before.
            let Some((key, interest)) = self.registry.get(fd) else {
                continue;
            };
            if self.fresh.contains(&key) {
                trace!(key = %key, fd, "readiness predates registration, skipped");
                continue;
            }
            let ops = Interest::from_epoll_events(bits, interest);
            if ops.is_empty() {
                continue;
            }
            self.dispatch(key, ops);
        }
        self.ready = ready;
    }

    fn dispatch(&mut self, key: JobKey, ready: Interest) {
        let Some(entry) = self.jobs.get_mut(&key) else {
            return;
        };
        let channel = entry.channel.map(Channel::new);
        trace!(key = %key, ready = %ready, "invoke");
        self.shared.stats.invoked();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            entry.job.invoke(channel, ready, &mut entry.handoff)
        }));
        match result {
            Ok(Ok(Outcome::Rearm(interest))) => self.rearm(key, interest),
            Ok(Ok(Outcome::Complete)) => {
                self.remove_entry(key);
                trace!(key = %key, "completed");
            }
            Ok(Err(e)) => self.fault(key, e),
            Err(payload) => self.fault(key, JobError::Panicked(panic_message(payload))),
        }
    }

    fn rearm(&mut self, key: JobKey, interest: Interest) {
        let has_channel = match self.jobs.get(&key) {
            Some(entry) => entry.channel.is_some(),
            None => return,
        };
        if !has_channel {
            // Timer-only: stays put until its deadline.
            return;
        }
        if interest.is_empty() {
            self.remove_entry(key);
            trace!(key = %key, "rearmed with empty interest, completed");
            return;
        }
        if let Err(e) = self.set_interest(key, interest) {
            self.fault(key, JobError::Io(e));
        }
    }

    fn fault(&mut self, key: JobKey, err: JobError) {
        if let Some(entry) = self.remove_entry(key) {
            warn!(key = %key, job = %entry.job.describe(), error = %err, "job faulted");
            self.shared.stats.faulted();
        }
    }

    /// Drop every trace of `key`. Dropping the entry drops an unfired
    /// handoff, which releases its waiter with `Abandoned`.
    fn remove_entry(&mut self, key: JobKey) -> Option<Entry> {
        let entry = self.jobs.remove(&key)?;
        self.timers.remove(key);
        self.shared.stats.set_active(self.jobs.len());
        if let Some(fd) = entry.channel {
            self.registry.remove(fd, key);
        }
        Some(entry)
    }

    fn notify_cancelled(&self, key: JobKey, job: &mut dyn Job) {
        self.shared.stats.cancelled();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.cancelled())) {
            warn!(
                key = %key,
                job = %job.describe(),
                error = %panic_message(payload),
                "job panicked in cancelled()"
            );
            self.shared.stats.faulted();
        }
    }

    /// Close the queue, apply what was still queued, cancel every job in
    /// registration order and release all channels. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stopping = true;

        for request in self.shared.queue.close() {
            self.apply(request);
        }
        let mut keys: Vec<JobKey> = self.jobs.keys().copied().collect();
        keys.sort_unstable();
        let cancelled = keys.len();
        for key in keys {
            if let Some(mut entry) = self.remove_entry(key) {
                self.notify_cancelled(key, entry.job.as_mut());
            }
        }
        self.shared.stats.set_active(0);
        info!(cancelled, "scheduler loop stopped");
    }

    /// Snapshot of every registered job, in key order.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut out: Vec<JobSnapshot> = self
            .jobs
            .iter()
            .map(|(&key, entry)| JobSnapshot {
                key,
                description: entry.job.describe(),
                channel: entry.channel,
                interest: entry.interest,
                deadline: entry.deadline,
            })
            .collect();
        out.sort_by_key(|s| s.key);
        out
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|(deadline, _)| deadline)
    }

    /// True once a shutdown request has been applied.
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.close();
    }
}

fn min_timeout(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
