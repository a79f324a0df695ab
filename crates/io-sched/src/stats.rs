// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Loop counters, readable from any thread.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time copy of the loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Completed loop iterations.
    pub iterations: u64,
    /// Registrations the loop installed.
    pub registered: u64,
    /// `Job::invoke` calls.
    pub invoked: u64,
    /// Jobs whose deadline passed without matching readiness.
    pub expired: u64,
    /// `Job::cancelled` calls, expirations included.
    pub cancelled: u64,
    /// Jobs deregistered after an error or panic.
    pub faulted: u64,
    /// Jobs currently registered.
    pub active: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    iterations: AtomicU64,
    registered: AtomicU64,
    invoked: AtomicU64,
    expired: AtomicU64,
    cancelled: AtomicU64,
    faulted: AtomicU64,
    active: AtomicUsize,
    /// Registrations submitted but not yet installed by the loop.
    pending: AtomicUsize,
}

impl Counters {
    pub fn iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registered(&self) {
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invoked(&self) {
        self.invoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn faulted(&self) {
        self.faulted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active(&self, n: usize) {
        self.active.store(n, Ordering::SeqCst);
    }

    pub fn submitted(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// A submitted registration was installed, rejected or refused.
    pub fn settled(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// No registered jobs and none on the way. The loop raises `active`
    /// before settling a registration, so this never sees a job in between.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.active() == 0
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            iterations: self.iterations.load(Ordering::Relaxed),
            registered: self.registered.load(Ordering::Relaxed),
            invoked: self.invoked.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            active: self.active(),
        }
    }
}
