//! Thread-local slots for the running fiber and worker
//!
//! Initialized by the scheduler when it adopts a thread; everything else
//! (fiber suspension, the hook layer) reads these.

use crate::arch::SavedContext;
use crate::fiber::Fiber;
use std::cell::Cell;

thread_local! {
    /// Fiber currently executing on this thread (null when none).
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// This worker's scheduler context save area.
    static SCHED_CONTEXT: Cell<*mut SavedContext> = const { Cell::new(std::ptr::null_mut()) };

    /// Worker index for this OS thread.
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

#[inline]
pub(crate) fn set_current_fiber(ptr: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(ptr));
}

#[inline]
pub(crate) fn clear_current_fiber() {
    CURRENT_FIBER.with(|c| c.set(std::ptr::null()));
}

/// Raw pointer to the running fiber, null outside fiber context.
#[inline]
pub fn current_fiber_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

/// Whether this thread is currently inside a fiber.
#[inline]
pub fn is_in_fiber() -> bool {
    !current_fiber_ptr().is_null()
}

#[inline]
pub(crate) fn set_sched_context(ptr: *mut SavedContext) {
    SCHED_CONTEXT.with(|c| c.set(ptr));
}

#[inline]
pub(crate) fn sched_context() -> *mut SavedContext {
    SCHED_CONTEXT.with(|c| c.get())
}

#[inline]
pub(crate) fn set_worker_id(id: usize) {
    WORKER_ID.with(|c| c.set(id));
}

/// Worker index, `usize::MAX` when not a worker thread.
#[inline]
pub fn worker_id() -> usize {
    WORKER_ID.with(|c| c.get())
}

/// Worker index, `None` when not a worker thread.
#[inline]
pub fn try_worker_id() -> Option<usize> {
    let id = worker_id();
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}
