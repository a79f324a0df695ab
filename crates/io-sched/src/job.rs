// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The job contract.
//!
//! A job is registered with a channel, a deadline, or both. The loop thread
//! calls `invoke` when the channel is ready (or when the job is fired
//! externally) and `cancelled` when the job leaves the scheduler without
//! completing. Exactly one terminal call happens per registration.

use std::fmt;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::JobError;
use crate::handoff::Handoff;
use crate::interest::Interest;

/// Identity of one registration. Never reused within a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey(u64);

impl JobKey {
    pub(crate) fn new(id: u64) -> Self {
        JobKey(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Borrowed view of the channel a job is registered on.
///
/// Only valid for the duration of one `invoke` call.
#[derive(Debug, Clone, Copy)]
pub struct Channel<'a> {
    fd: RawFd,
    _call: PhantomData<&'a ()>,
}

impl<'a> Channel<'a> {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            _call: PhantomData,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl AsRawFd for Channel<'_> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// What the scheduler should do with a job after `invoke` returns normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stay registered with this interest mask. The deadline, if any, is
    /// kept as is. An empty mask on a channel job is treated as `Complete`.
    Rearm(Interest),
    /// Deregister. No further calls.
    Complete,
}

/// A unit of work driven by channel readiness and/or a deadline.
///
/// Jobs run on the loop thread and must not block. A job that returns
/// `Err` or panics is deregistered and logged; the loop keeps running.
pub trait Job: Send + 'static {
    /// Called when the channel reports readiness in `ready`, which is always
    /// a non-empty subset of the current interest mask. For an externally
    /// fired job `ready` is empty and `channel` is whatever the job is
    /// registered on.
    ///
    /// `handoff` holds the registration's handoff until someone takes it;
    /// `handoff.take().map(Handoff::fire)` releases the waiting producer.
    fn invoke(
        &mut self,
        channel: Option<Channel<'_>>,
        ready: Interest,
        handoff: &mut Option<Handoff>,
    ) -> Result<Outcome, JobError>;

    /// Called once when the job is deregistered without completing: its
    /// deadline passed with no matching readiness, it was cancelled, its
    /// channel was taken over by another registration, or the scheduler
    /// shut down.
    fn cancelled(&mut self);

    /// Description used in diagnostic records.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff;

    struct Echo {
        calls: usize,
    }

    impl Job for Echo {
        fn invoke(
            &mut self,
            channel: Option<Channel<'_>>,
            ready: Interest,
            handoff: &mut Option<Handoff>,
        ) -> Result<Outcome, JobError> {
            self.calls += 1;
            if let Some(h) = handoff.take() {
                h.fire();
            }
            match channel {
                Some(ch) if ch.fd() < 0 => Err(JobError::failed("bad fd")),
                _ if self.calls < 2 => Ok(Outcome::Rearm(ready)),
                _ => Ok(Outcome::Complete),
            }
        }

        fn cancelled(&mut self) {}
    }

    #[test]
    fn key_display() {
        assert_eq!(JobKey::new(12).to_string(), "job#12");
        assert!(JobKey::new(1) < JobKey::new(2));
    }

    #[test]
    fn default_describe_names_the_type() {
        let job: Box<dyn Job> = Box::new(Echo { calls: 0 });
        assert!(job.describe().ends_with("Echo"));
    }

    #[test]
    fn handoff_taken_once() {
        let mut job = Echo { calls: 0 };
        let (h, waiter) = handoff::handoff();
        let mut slot = Some(h);

        let out = job
            .invoke(Some(Channel::new(5)), Interest::READABLE, &mut slot)
            .unwrap();
        assert_eq!(out, Outcome::Rearm(Interest::READABLE));
        assert!(slot.is_none());
        assert_eq!(waiter.wait(), Ok(()));

        let out = job.invoke(None, Interest::empty(), &mut slot).unwrap();
        assert_eq!(out, Outcome::Complete);
    }

    #[test]
    fn channel_exposes_raw_fd() {
        let ch = Channel::new(9);
        assert_eq!(ch.as_raw_fd(), 9);
    }
}
