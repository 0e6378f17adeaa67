//! Timer queue
//!
//! Ordered deadlines with cancellation, backing both the sleep shims and
//! per-I/O timeouts. Two flavors:
//!
//! - plain timers: the callback fires once at the deadline;
//! - condition timers: the callback fires only if an associated weak
//!   reference still upgrades, so a timer racing a completed operation is a
//!   silent no-op.
//!
//! The queue never runs callbacks itself; the scheduler's workers call
//! [`TimerQueue::tick`] and invoke what it returns outside the lock.

mod entry;
mod heap;

pub use entry::{TimerEntry, TimerId};
pub use heap::TimerQueue;

use std::any::Any;
use std::sync::Weak;

/// Boxed timer callback.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Weak liveness guard for condition timers.
pub type TimerCondition = Weak<dyn Any + Send + Sync>;
