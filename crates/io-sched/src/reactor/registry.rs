// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channel registry: fd -> (job, interest), mirrored into epoll.
//!
//! Every mutation updates the map and the epoll set together, so both agree
//! before the next wait. One job per fd; registering an fd that is already
//! owned replaces the owner.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::debug;

use crate::interest::Interest;
use crate::job::JobKey;

use super::poller::{Events, Poller};

pub(crate) struct ChannelRegistry {
    poller: Poller,
    channels: HashMap<RawFd, (JobKey, Interest)>,
}

impl ChannelRegistry {
    pub fn new(poller: Poller) -> Self {
        Self {
            poller,
            channels: HashMap::new(),
        }
    }

    /// Register `fd` for `key`. Returns the job that previously owned the fd.
    ///
    /// On error nothing changes.
    pub fn insert(
        &mut self,
        fd: RawFd,
        key: JobKey,
        interest: Interest,
    ) -> io::Result<Option<JobKey>> {
        let displaced = match self.channels.get(&fd) {
            Some(&(owner, _)) => {
                self.rearm(fd, interest)?;
                Some(owner)
            }
            None => {
                self.poller.add(fd, interest)?;
                None
            }
        };
        self.channels.insert(fd, (key, interest));
        Ok(displaced)
    }

    /// Change the interest mask of a registered fd.
    pub fn update(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let Some(entry) = self.channels.get(&fd).copied() else {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        };
        if entry.1 != interest {
            self.rearm(fd, interest)?;
            self.channels.insert(fd, (entry.0, interest));
        }
        Ok(())
    }

    /// MOD, falling back to ADD when the kernel already dropped the fd
    /// (closed and reopened under the same number while registered).
    fn rearm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.poller.modify(fd, interest) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                debug!(fd, "fd vanished from epoll set, re-adding");
                self.poller.add(fd, interest)
            }
            other => other,
        }
    }

    /// Remove `fd` if it is still owned by `key`.
    pub fn remove(&mut self, fd: RawFd, key: JobKey) -> bool {
        match self.channels.get(&fd) {
            Some(&(owner, _)) if owner == key => {
                self.channels.remove(&fd);
                if let Err(e) = self.poller.delete(fd) {
                    debug!(fd, error = %e, "epoll delete failed");
                }
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<(JobKey, Interest)> {
        self.channels.get(&fd).copied()
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poller.wait(events, timeout)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[cfg(test)]
    pub fn close_poller(&mut self) {
        self.poller.close_early();
    }
}
