//! Fiber identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a fiber.
///
/// Allocated from a process-wide counter; ids are never reused. The maximum
/// value (`u64::MAX`) is reserved as the "no fiber" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel value indicating no fiber.
    pub const NONE: FiberId = FiberId(u64::MAX);

    /// Allocate the next unused id.
    #[inline]
    pub fn new_unique() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        FiberId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an id from a raw value.
    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check whether this is the NONE sentinel.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Check whether this names an actual fiber.
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
