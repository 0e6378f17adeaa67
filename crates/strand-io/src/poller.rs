//! Thin epoll wrapper
//!
//! Interest registrations are edge-triggered (EPOLLET); several workers may
//! block in `wait` on the same epoll fd and the kernel delivers each edge to
//! one of them.

use crate::error::{IoError, IoResult};
use std::os::unix::io::RawFd;

pub struct Poller {
    epfd: RawFd,
}

// The epoll fd itself is safe to share across threads.
unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

impl Poller {
    pub fn new() -> IoResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(IoError::Os(unsafe { *libc::__errno_location() }));
        }
        Ok(Self { epfd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.epfd
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> IoResult<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            return Err(IoError::Os(unsafe { *libc::__errno_location() }));
        }
        Ok(())
    }

    /// Start watching `fd` for `events` (caller includes EPOLLET).
    pub fn add(&self, fd: RawFd, events: u32) -> IoResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Change the interest set of a watched fd.
    pub fn modify(&self, fd: RawFd, events: u32) -> IoResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    /// Stop watching `fd`.
    pub fn remove(&self, fd: RawFd) -> IoResult<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Block for up to `timeout_ms` (-1 = forever). EINTR reports as zero
    /// events so callers just re-loop.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> IoResult<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno == libc::EINTR {
                return Ok(0);
            }
            return Err(IoError::Os(errno));
        }
        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventfd::EventFd;

    #[test]
    fn test_wait_times_out() {
        let p = Poller::new().expect("poller");
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 8];
        let start = std::time::Instant::now();
        let n = p.wait(&mut events, 30).expect("wait");
        assert_eq!(n, 0);
        assert!(start.elapsed() >= std::time::Duration::from_millis(25));
    }

    #[test]
    fn test_eventfd_readiness() {
        let p = Poller::new().expect("poller");
        let efd = EventFd::create().expect("eventfd");
        p.add(efd.fd(), libc::EPOLLIN as u32 | libc::EPOLLET as u32)
            .expect("add");

        efd.notify();
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 8];
        let n = p.wait(&mut events, 1000).expect("wait");
        assert_eq!(n, 1);
        let fd = events[0].u64 as RawFd;
        assert_eq!(fd, efd.fd());

        p.remove(efd.fd()).expect("remove");
    }
}
