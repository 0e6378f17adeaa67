//! Readiness event direction

use core::fmt;

/// I/O direction a fiber can wait on. At most one fiber may be pending per
/// (fd, direction) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    /// Corresponding epoll interest bit.
    #[inline]
    pub(crate) fn epoll_bits(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Read => f.write_str("READ"),
            Event::Write => f.write_str("WRITE"),
        }
    }
}
