// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness interest masks.
//!
//! Four conditions, as in socket selectors: readable, writable, acceptable
//! (listener has a pending connection) and connectable (non-blocking connect
//! finished). epoll only knows IN and OUT, so acceptable folds into IN and
//! connectable into OUT.

use bitflags::bitflags;

bitflags! {
    /// Set of readiness conditions a job wants to hear about, or that a
    /// channel reported.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u8 {
        const READABLE = 0x1;
        const WRITABLE = 0x2;
        const ACCEPTABLE = 0x4;
        const CONNECTABLE = 0x8;
    }
}

impl Interest {
    const IN_SIDE: Interest = Interest::READABLE.union(Interest::ACCEPTABLE);
    const OUT_SIDE: Interest = Interest::WRITABLE.union(Interest::CONNECTABLE);

    /// epoll event mask to register for this interest.
    pub(crate) fn to_epoll_events(self) -> u32 {
        let mut events = 0u32;
        if self.intersects(Self::IN_SIDE) {
            events |= libc::EPOLLIN as u32;
        }
        if self.intersects(Self::OUT_SIDE) {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    /// Conditions reported by an epoll event mask, restricted to `interest`.
    ///
    /// Errors and hangups report every registered condition so the job
    /// attempts its I/O and observes the failure itself.
    pub(crate) fn from_epoll_events(events: u32, interest: Interest) -> Interest {
        let mut ready = Interest::empty();
        if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            return interest;
        }
        if events & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0 {
            ready |= Self::IN_SIDE;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            ready |= Self::OUT_SIDE;
        }
        ready & interest
    }
}

impl std::fmt::Display for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{}", name.to_lowercase())?;
            first = false;
        }
        Ok(())
    }
}
