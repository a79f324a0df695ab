// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline index.
//!
//! Ordered set of `(deadline, key)` plus a reverse map for removal by key.
//! Insert, remove and pop-min are all O(log n). Equal deadlines pop in key
//! order, which is registration order.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::job::JobKey;

#[derive(Default)]
pub(crate) struct TimerIndex {
    by_deadline: BTreeSet<(Instant, JobKey)>,
    by_key: HashMap<JobKey, Instant>,
}

impl TimerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or move the entry for `key`. A key is in the index at most once.
    pub fn insert(&mut self, key: JobKey, deadline: Instant) {
        if let Some(old) = self.by_key.insert(key, deadline) {
            self.by_deadline.remove(&(old, key));
        }
        self.by_deadline.insert((deadline, key));
    }

    pub fn remove(&mut self, key: JobKey) -> Option<Instant> {
        let deadline = self.by_key.remove(&key)?;
        self.by_deadline.remove(&(deadline, key));
        Some(deadline)
    }

    pub fn peek(&self) -> Option<(Instant, JobKey)> {
        self.by_deadline.first().copied()
    }

    /// Pop the earliest entry if its deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(Instant, JobKey)> {
        let (deadline, key) = self.peek()?;
        if deadline > now {
            return None;
        }
        self.by_deadline.pop_first();
        self.by_key.remove(&key);
        Some((deadline, key))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

}
