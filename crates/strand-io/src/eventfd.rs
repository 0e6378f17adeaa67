//! Eventfd tickler
//!
//! Wakes workers blocked in `epoll_wait` when new work is scheduled.
//! Coalescing: multiple `notify` calls before a drain produce one wakeup
//! (eventfd counter semantics).

use crate::error::{IoError, IoResult};
use std::os::unix::io::RawFd;

pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// Create a fresh non-blocking eventfd; owned, closed on Drop.
    pub fn create() -> IoResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(IoError::Os(unsafe { *libc::__errno_location() }));
        }
        Ok(Self { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bump the counter, waking one epoll waiter.
    pub fn notify(&self) {
        let val: u64 = 1;
        let rt = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rt < 0 {
            let errno = unsafe { *libc::__errno_location() };
            // EAGAIN means the counter is saturated; a wakeup is already
            // pending, nothing to do.
            if errno != libc::EAGAIN {
                strand_core::fwarn!("eventfd notify failed: errno {}", errno);
            }
        }
    }

    /// Consume any pending count so the next notify produces a fresh edge.
    pub fn drain(&self) {
        let mut buf: u64 = 0;
        loop {
            let rt = unsafe {
                libc::read(
                    self.fd,
                    &mut buf as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if rt < 0 {
                break;
            }
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
