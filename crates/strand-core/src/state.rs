//! Fiber lifecycle states
//!
//! The state machine doubles as the wakeup handshake between a parking fiber
//! and whoever resumes it. A fiber must never appear on a ready queue before
//! its register file has been saved, so the transitions that publish a fiber
//! as runnable are split between the fiber itself, the worker that switched
//! away from it, and the waker:
//!
//! ```text
//! spawn:            Created ──► Ready            (queued by the spawner)
//! switch-in:        Ready   ──► Running          (worker)
//! voluntary yield:  Running ──► Ready            (requeued by the worker
//!                                                 after the context save)
//! park:             Running ──► Parking ──► Blocked
//!                              (fiber)     (worker, after the save)
//! wake:             Blocked ──► Ready            (waker queues + notifies)
//!                   Parking ──► Notified         (worker queues after save)
//!                   Running ──► Notified         (latched; block_current
//!                                                 consumes it in place)
//! completion:       Running ──► Finished
//! ```

use core::fmt;

/// State of a fiber, stored in an `AtomicU8` on the fiber itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Just created, not yet queued.
    Created = 0,

    /// Runnable: queued or about to be queued.
    Ready = 1,

    /// Currently executing on a worker thread.
    Running = 2,

    /// Asked to park; register file not yet saved.
    Parking = 3,

    /// Parked; context saved, waiting for a wakeup.
    Blocked = 4,

    /// A wakeup arrived before the park completed.
    Notified = 5,

    /// Entry closure returned; awaiting cleanup.
    Finished = 6,
}

impl FiberState {
    /// Whether a worker may switch into this fiber.
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Whether the fiber has terminated.
    #[inline]
    pub const fn is_finished(&self) -> bool {
        matches!(self, FiberState::Finished)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Created,
            1 => FiberState::Ready,
            2 => FiberState::Running,
            3 => FiberState::Parking,
            4 => FiberState::Blocked,
            5 => FiberState::Notified,
            _ => FiberState::Finished,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(s: FiberState) -> u8 {
        s as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberState::Created => "created",
            FiberState::Ready => "ready",
            FiberState::Running => "running",
            FiberState::Parking => "parking",
            FiberState::Blocked => "blocked",
            FiberState::Notified => "notified",
            FiberState::Finished => "finished",
        };
        f.write_str(name)
    }
}
