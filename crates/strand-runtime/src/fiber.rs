//! Stackful fiber primitive
//!
//! A `Fiber` is a cooperatively scheduled coroutine with its own call stack:
//! it can suspend from arbitrary depth (`yield_now`, `block_current`) and is
//! resumed by a scheduler worker switching into its saved context.
//!
//! Publication rule: a fiber may be pushed onto a ready queue only after its
//! register file is saved. `yield_now`/`block_current` therefore never queue
//! the fiber themselves; the worker does it after the switch back (see the
//! state machine in `strand_core::state`).

use crate::arch::{self, SavedContext};
use crate::stack::FiberStack;
use crate::tls;

use strand_core::{ferror, FiberId, FiberState, RuntimeResult};

use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// A stackful, cooperatively scheduled fiber. Always handled as `Arc<Fiber>`.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    regs: UnsafeCell<SavedContext>,
    stack: FiberStack,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
}

// The register file and entry slot are only touched by the thread that
// currently runs (or resumes) the fiber; the state atomic serializes that
// handoff.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber ready to run `entry` on a fresh stack.
    pub(crate) fn new(
        stack_size: usize,
        entry: Box<dyn FnOnce() + Send>,
    ) -> RuntimeResult<Arc<Fiber>> {
        let stack = FiberStack::allocate(stack_size)?;
        let fiber = Arc::new(Fiber {
            id: FiberId::new_unique(),
            state: AtomicU8::new(FiberState::Created as u8),
            regs: UnsafeCell::new(SavedContext::zeroed()),
            stack,
            entry: UnsafeCell::new(Some(entry)),
        });

        let arg = Arc::as_ptr(&fiber) as usize;
        unsafe {
            arch::init_context(
                fiber.regs.get(),
                fiber.stack.top(),
                fiber_entry as usize,
                arg,
            );
        }
        Ok(fiber)
    }

    /// This fiber's id.
    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn swap_state(&self, s: FiberState) -> FiberState {
        FiberState::from(self.state.swap(s as u8, Ordering::AcqRel))
    }

    #[inline]
    pub(crate) fn cas_state(&self, from: FiberState, to: FiberState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn regs_ptr(&self) -> *mut SavedContext {
        self.regs.get()
    }

    /// Handle to the fiber running on this thread, if any.
    ///
    /// This is the `GetThis()` of the runtime: the hook layer captures the
    /// returned handle before suspending so a timer or readiness event can
    /// reschedule it.
    pub fn current() -> Option<Arc<Fiber>> {
        let ptr = tls::current_fiber_ptr();
        if ptr.is_null() {
            return None;
        }
        // Fibers are always Arc-allocated; reconstruct a counted handle.
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Entry point executed on the fiber's own stack.
extern "C" fn fiber_entry(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };
    let entry = unsafe { (*fiber.entry.get()).take() };
    if let Some(f) = entry {
        // A panic must not unwind through the naked trampoline frame.
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            ferror!("fiber {} panicked", fiber.id);
        }
    }
}

/// Called by the arch trampoline after the entry closure returns.
///
/// Marks the fiber finished and transfers to the worker's scheduler context;
/// never returns.
pub(crate) extern "C" fn fiber_finished() {
    let ptr = tls::current_fiber_ptr();
    if ptr.is_null() {
        // No way back without a fiber context; stop here rather than return
        // into a dead frame.
        ferror!("fiber_finished outside fiber context");
        std::process::abort();
    }
    let fiber = unsafe { &*ptr };
    fiber.set_state(FiberState::Finished);

    let sched = tls::sched_context();
    unsafe {
        arch::switch_context(fiber.regs_ptr(), sched);
    }
    unreachable!("finished fiber was resumed");
}

/// Suspend the current fiber, keeping it runnable.
///
/// Outside a fiber this yields the OS thread.
#[inline]
pub fn yield_now() {
    let ptr = tls::current_fiber_ptr();
    if ptr.is_null() {
        std::thread::yield_now();
        return;
    }
    let fiber = unsafe { &*ptr };

    // Ready, but NOT queued: the worker requeues after the context save.
    fiber.set_state(FiberState::Ready);
    switch_to_scheduler(fiber);
}

/// Suspend the current fiber until something calls `Scheduler::schedule` on
/// it (a timer firing, a readiness event, an explicit cancel).
///
/// A wakeup that arrived while the fiber was still on-CPU is latched as
/// `Notified` and consumed here without switching. Outside a fiber this is a
/// no-op.
#[inline]
pub fn block_current() {
    let ptr = tls::current_fiber_ptr();
    if ptr.is_null() {
        return;
    }
    let fiber = unsafe { &*ptr };

    let prev = fiber.swap_state(FiberState::Parking);
    if prev == FiberState::Notified {
        // The wakeup beat us to the park; consume it and keep running.
        fiber.set_state(FiberState::Running);
        return;
    }
    switch_to_scheduler(fiber);
}

#[inline]
fn switch_to_scheduler(fiber: &Fiber) {
    let sched = tls::sched_context();
    debug_assert!(!sched.is_null(), "fiber running without a scheduler context");
    unsafe {
        arch::switch_context(fiber.regs_ptr(), sched);
    }
    // Resumed by a worker; state was set back to Running in run_fiber.
}
