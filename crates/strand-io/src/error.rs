//! I/O manager error types

use crate::event::Event;
use core::fmt;
use strand_core::RuntimeError;

pub type IoResult<T> = Result<T, IoError>;

/// Errors surfaced by the event loop.
#[derive(Debug)]
pub enum IoError {
    /// A fiber is already pending on this (fd, direction).
    EventExists { fd: libc::c_int, event: Event },

    /// The call requires a running fiber context.
    NotInFiber,

    /// Scheduler-level failure.
    Runtime(RuntimeError),

    /// OS error with errno (epoll_ctl, eventfd, ...).
    Os(i32),
}

impl IoError {
    /// The errno a POSIX-shaped caller should observe for this error.
    pub fn errno(&self) -> i32 {
        match self {
            IoError::EventExists { .. } => libc::EEXIST,
            IoError::NotInFiber => libc::EINVAL,
            IoError::Runtime(_) => libc::EINVAL,
            IoError::Os(e) => *e,
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::EventExists { fd, event } => {
                write!(f, "fiber already pending on fd {} {}", fd, event)
            }
            IoError::NotInFiber => write!(f, "no running fiber"),
            IoError::Runtime(e) => write!(f, "runtime: {}", e),
            IoError::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for IoError {}

impl From<RuntimeError> for IoError {
    fn from(e: RuntimeError) -> Self {
        IoError::Runtime(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let e = IoError::EventExists {
            fd: 3,
            event: Event::Read,
        };
        assert_eq!(e.errno(), libc::EEXIST);
        assert_eq!(IoError::Os(libc::ENOMEM).errno(), libc::ENOMEM);
    }
}
