// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! epoll instance and eventfd waker.
//!
//! Level-triggered. Channel registrations carry the fd as the event token;
//! the waker uses `WAKE_TOKEN`, which no fd can collide with.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::interest::Interest;

pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// Owned epoll instance.
pub(crate) struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd })
    }

    /// Register the waker's eventfd so a submission interrupts `wait`.
    pub fn add_waker(&self, waker: &Waker) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, waker.fd, libc::EPOLLIN as u32, WAKE_TOKEN)
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest.to_epoll_events(), fd as u64)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest.to_epoll_events(), fd as u64)
    }

    /// Remove `fd`. ENOENT / EBADF are expected if the fd was already closed.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until an event arrives or `timeout` passes. `None` blocks
    /// indefinitely. EINTR returns with no events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.len = 0;
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.buf.as_mut_ptr(),
                events.buf.len() as i32,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        events.len = n as usize;
        Ok(())
    }

    /// Close the epoll fd early so the next `wait` fails with EBADF.
    #[cfg(test)]
    pub fn close_early(&mut self) {
        if self.epoll_fd >= 0 {
            unsafe { libc::close(self.epoll_fd) };
            self.epoll_fd = -1;
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if self.epoll_fd >= 0 {
            unsafe {
                libc::close(self.epoll_fd);
            }
        }
    }
}

/// Millisecond timeout for `epoll_wait`, rounded up so the loop never
/// wakes just short of a deadline and spins.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// Event buffer filled by `Poller::wait`.
pub(crate) struct Events {
    buf: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    /// `(token, epoll event bits)` pairs from the last wait.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.buf[..self.len].iter().map(|ev| {
            let token = ev.u64;
            let bits = ev.events;
            (token, bits)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Cross-thread wake signal backed by an eventfd.
///
/// `notified` collapses bursts of submissions into one eventfd write. The
/// loop calls `reset` and then `clear` before taking the queue, so the first
/// submission after the take always writes and the next wait returns.
pub(crate) struct Waker {
    fd: RawFd,
    notified: AtomicBool,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            notified: AtomicBool::new(false),
        })
    }

    /// Interrupt the loop's wait. Never blocks.
    pub fn wake(&self) {
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        let val: u64 = 1;
        unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Drain the eventfd counter (value doesn't matter).
    pub fn reset(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    /// Allow the next `wake` to write again.
    pub fn clear(&self) {
        self.notified.store(false, Ordering::Release);
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
