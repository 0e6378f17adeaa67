//! Timer entry and id types

use super::{TimerCallback, TimerCondition};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Unique handle for cancelling a queued timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Allocate the next unused id.
    #[inline]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for TimerId {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued timer: deadline, callback, optional liveness guard.
pub struct TimerEntry {
    pub(crate) id: TimerId,
    pub(crate) deadline: Instant,
    pub(crate) callback: TimerCallback,
    pub(crate) condition: Option<TimerCondition>,
}

impl TimerEntry {
    /// Plain one-shot timer.
    pub fn new(delay: Duration, callback: TimerCallback) -> Self {
        Self {
            id: TimerId::new(),
            deadline: Instant::now() + delay,
            callback,
            condition: None,
        }
    }

    /// Condition timer: fires only if `condition` still upgrades at expiry.
    pub fn with_condition(delay: Duration, callback: TimerCallback, condition: TimerCondition) -> Self {
        Self {
            id: TimerId::new(),
            deadline: Instant::now() + delay,
            callback,
            condition: Some(condition),
        }
    }

    #[inline]
    pub fn id(&self) -> TimerId {
        self.id
    }

    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}
