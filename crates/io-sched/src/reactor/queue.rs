// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Submission queue: the only path from producer threads into the loop.
//!
//! Mutex-protected VecDeque plus the eventfd waker. Producers push and wake;
//! the loop takes the whole backlog once per iteration. Closing the queue
//! happens under the same lock, so a request is either drained by the loop
//! or handed back to its producer as `Stopped`, never silently dropped.

use std::collections::VecDeque;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::SchedError;
use crate::handoff::Handoff;
use crate::interest::Interest;
use crate::job::{Job, JobKey};

use super::poller::Waker;

/// A registration travelling from a producer to the loop.
pub(crate) struct Registration {
    pub key: JobKey,
    pub job: Box<dyn Job>,
    pub channel: Option<(RawFd, Interest)>,
    pub deadline: Option<Instant>,
    pub handoff: Option<Handoff>,
}

/// Work for the loop thread. Immutable once enqueued.
pub(crate) enum Request {
    Register(Box<Registration>),
    Cancel(JobKey),
    UpdateInterest(JobKey, Interest),
    Fire(JobKey),
    Shutdown,
}

impl Request {
    fn counts_against_capacity(&self) -> bool {
        matches!(self, Request::Register(_))
    }
}

struct QueueState {
    requests: VecDeque<Request>,
    /// Pending registrations, the only requests bounded by `capacity`.
    registrations: usize,
    closed: bool,
}

pub(crate) struct SubmissionQueue {
    state: Mutex<QueueState>,
    capacity: Option<usize>,
    waker: Waker,
}

impl SubmissionQueue {
    pub fn new(capacity: Option<usize>, waker: Waker) -> Self {
        Self {
            state: Mutex::new(QueueState {
                requests: VecDeque::new(),
                registrations: 0,
                closed: false,
            }),
            capacity,
            waker,
        }
    }

    pub fn waker(&self) -> &Waker {
        &self.waker
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue and wake the loop. Never blocks beyond the queue lock.
    ///
    /// Cancels, interest updates, fires and shutdown bypass the capacity
    /// bound so they cannot be starved by a flood of registrations.
    pub fn push(&self, request: Request) -> Result<(), SchedError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(SchedError::Stopped);
            }
            if request.counts_against_capacity() {
                if let Some(capacity) = self.capacity {
                    if state.registrations >= capacity {
                        return Err(SchedError::QueueFull { capacity });
                    }
                }
                state.registrations += 1;
            }
            state.requests.push_back(request);
        }
        self.waker.wake();
        Ok(())
    }

    /// Take everything queued so far, in submission order.
    pub fn drain(&self) -> VecDeque<Request> {
        let mut state = self.lock();
        state.registrations = 0;
        mem::take(&mut state.requests)
    }

    /// Refuse further pushes and return whatever is still queued.
    pub fn close(&self) -> VecDeque<Request> {
        let mut state = self.lock();
        state.closed = true;
        state.registrations = 0;
        mem::take(&mut state.requests)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

}
