//! Error types for the strand runtime

use core::fmt;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur in runtime operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The scheduler has not been started.
    NotStarted,

    /// The scheduler was already started.
    AlreadyStarted,

    /// A configuration field failed validation.
    InvalidConfig(&'static str),

    /// Fiber stack allocation (mmap/mprotect) failed.
    StackAlloc(i32),

    /// Called from outside a fiber where a fiber context is required.
    NotInFiber,

    /// OS error with errno.
    Os(i32),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::NotStarted => write!(f, "scheduler not started"),
            RuntimeError::AlreadyStarted => write!(f, "scheduler already started"),
            RuntimeError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            RuntimeError::StackAlloc(e) => write!(f, "fiber stack allocation failed: errno {}", e),
            RuntimeError::NotInFiber => write!(f, "not running inside a fiber"),
            RuntimeError::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {}
