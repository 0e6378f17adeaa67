//! I/O event loop
//!
//! An `IoManager` couples the fiber scheduler with an epoll instance and the
//! shared timer queue. Worker threads run fibers while any are ready and
//! otherwise block in `epoll_wait`; readiness events, timer deadlines and
//! explicit cancellations all funnel into `Scheduler::schedule`.
//!
//! Pending continuations are keyed by `(fd, direction)` with at most one
//! waiting fiber per pair. Whoever takes the waiter first — the epoll loop,
//! `cancel_event`, or `cancel_all` — dispatches it exactly once; a forced
//! resume is indistinguishable from readiness except through state shared by
//! the caller (see the hook layer's `TimerInfo`).

use crate::error::{IoError, IoResult};
use crate::event::Event;
use crate::eventfd::EventFd;
use crate::poller::Poller;

use strand_core::{fdebug, ferror, fwarn};
use strand_runtime::scheduler::{Idler, Scheduler};
use strand_runtime::timer::{TimerCondition, TimerId};
use strand_runtime::{Fiber, RuntimeConfig};

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

thread_local! {
    /// IoManager owning this worker thread.
    static CURRENT_IOM: RefCell<Weak<IoManager>> = const { RefCell::new(Weak::new()) };
}

/// Waiting fibers for one descriptor.
#[derive(Default)]
struct Waiters {
    /// Union of armed `Event::epoll_bits`.
    registered: u32,
    read: Option<Arc<Fiber>>,
    write: Option<Arc<Fiber>>,
}

impl Waiters {
    fn slot_mut(&mut self, event: Event) -> &mut Option<Arc<Fiber>> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

struct FdEvents {
    fd: libc::c_int,
    waiters: Mutex<Waiters>,
}

impl FdEvents {
    fn new(fd: libc::c_int) -> Self {
        Self {
            fd,
            waiters: Mutex::new(Waiters::default()),
        }
    }
}

/// Event-loop manager: scheduler + epoll + timers.
pub struct IoManager {
    sched: Arc<Scheduler>,
    poller: Poller,
    tickler: EventFd,
    fd_events: RwLock<Vec<Option<Arc<FdEvents>>>>,
    pending: AtomicUsize,
}

impl IoManager {
    /// Build and start an IoManager: workers come up with the hook layer
    /// enabled and this manager bound to their thread.
    pub fn new(config: RuntimeConfig) -> IoResult<Arc<Self>> {
        let sched = Scheduler::new(config)?;
        let poller = Poller::new()?;
        let tickler = EventFd::create()?;
        poller.add(
            tickler.fd(),
            libc::EPOLLIN as u32 | libc::EPOLLET as u32,
        )?;

        let iom = Arc::new(Self {
            sched,
            poller,
            tickler,
            fd_events: RwLock::new(Vec::with_capacity(64)),
            pending: AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&iom);
        iom.sched.set_idler(Arc::new(EpollIdler { iom: weak.clone() }));
        iom.sched.set_thread_init(Arc::new(move |_worker| {
            CURRENT_IOM.with(|c| *c.borrow_mut() = weak.clone());
            crate::hook::set_enabled(true);
        }));
        iom.sched.start()?;
        Ok(iom)
    }

    /// The IoManager owning the current thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IOM.with(|c| c.borrow().upgrade())
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Spawn a fiber on this manager.
    pub fn spawn<F>(&self, f: F) -> IoResult<strand_core::FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(self.sched.spawn(f)?)
    }

    /// Make a fiber runnable again (wakeup path for timers and events).
    pub fn schedule(&self, fiber: Arc<Fiber>) {
        self.sched.schedule(fiber);
    }

    /// Queue a one-shot timer.
    pub fn add_timer<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.add_timer(delay, Box::new(cb))
    }

    /// Queue a condition timer; inert at expiry if `cond` is dead.
    pub fn add_condition_timer<F>(&self, delay: Duration, cb: F, cond: TimerCondition) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.add_condition_timer(delay, Box::new(cb), cond)
    }

    /// Cancel a queued timer; idempotent.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.sched.cancel_timer(id)
    }

    /// Continuations currently armed.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Request shutdown and join the workers. Call from outside the pool.
    pub fn stop(&self) {
        self.sched.stop();
    }

    fn events_ctx(&self, fd: libc::c_int, create: bool) -> Option<Arc<FdEvents>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.fd_events.read().unwrap();
            if let Some(Some(ctx)) = slots.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !create {
            return None;
        }
        let mut slots = self.fd_events.write().unwrap();
        if slots.len() <= idx {
            slots.resize(idx + 1, None);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdEvents::new(fd)));
        }
        slots[idx].clone()
    }

    /// Arm `(fd, event)` with the current fiber as continuation.
    ///
    /// The caller parks afterwards (`block_current`); a wakeup that fires in
    /// between is latched by the fiber state machine. Fails with
    /// `EventExists` when a fiber is already pending on the pair.
    pub fn add_event(&self, fd: libc::c_int, event: Event) -> IoResult<()> {
        let fiber = Fiber::current().ok_or(IoError::NotInFiber)?;
        let ctx = self
            .events_ctx(fd, true)
            .ok_or(IoError::Os(libc::EBADF))?;

        let mut w = ctx.waiters.lock().unwrap();
        let bits = event.epoll_bits();
        if w.registered & bits != 0 {
            fwarn!("add_event({}, {}): a fiber is already pending", fd, event);
            return Err(IoError::EventExists { fd, event });
        }

        let interest = libc::EPOLLET as u32 | w.registered | bits;
        let rt = if w.registered == 0 {
            self.poller.add(fd, interest)
        } else {
            self.poller.modify(fd, interest)
        };
        rt?;

        w.registered |= bits;
        *w.slot_mut(event) = Some(fiber);
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Disarm `(fd, event)` and take its continuation, narrowing or removing
    /// the epoll interest. Returns None when nothing was pending.
    fn take_waiter(&self, ctx: &FdEvents, event: Event) -> Option<Arc<Fiber>> {
        let mut w = ctx.waiters.lock().unwrap();
        let bits = event.epoll_bits();
        if w.registered & bits == 0 {
            return None;
        }
        w.registered &= !bits;

        // The fd may already be gone from the kernel's interest list (close
        // auto-removes it); failures here are harmless.
        let rt = if w.registered == 0 {
            self.poller.remove(ctx.fd)
        } else {
            self.poller.modify(ctx.fd, libc::EPOLLET as u32 | w.registered)
        };
        if let Err(e) = rt {
            fdebug!("epoll narrow({}) after {}: {}", ctx.fd, event, e);
        }

        let fiber = w.slot_mut(event).take();
        if fiber.is_some() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        fiber
    }

    /// Force-fire a pending continuation, if any.
    ///
    /// The resumed fiber observes cancellation only through state it shares
    /// with the canceller; from the scheduler's view this is a normal resume.
    pub fn cancel_event(&self, fd: libc::c_int, event: Event) -> bool {
        let Some(ctx) = self.events_ctx(fd, false) else {
            return false;
        };
        match self.take_waiter(&ctx, event) {
            Some(fiber) => {
                self.sched.schedule(fiber);
                true
            }
            None => false,
        }
    }

    /// Force-fire every pending continuation for `fd`. Returns how many
    /// fibers were dispatched.
    pub fn cancel_all(&self, fd: libc::c_int) -> usize {
        let mut fired = 0;
        for event in [Event::Read, Event::Write] {
            if self.cancel_event(fd, event) {
                fired += 1;
            }
        }
        fired
    }

    /// One epoll pass: wait up to `timeout`, dispatch readiness.
    fn poll(&self, timeout: Option<Duration>) {
        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 256];
        let n = match self.poller.wait(&mut events, timeout_ms) {
            Ok(n) => n,
            Err(e) => {
                ferror!("epoll_wait failed: {}", e);
                return;
            }
        };

        for ev in &events[..n] {
            let fd = ev.u64 as libc::c_int;
            if fd == self.tickler.fd() {
                self.tickler.drain();
                continue;
            }

            let mut mask = ev.events;
            // Errors and hangups wake both directions so waiters can surface
            // the failure through a retried syscall.
            if mask & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                mask |= libc::EPOLLIN as u32 | libc::EPOLLOUT as u32;
            }

            let Some(ctx) = self.events_ctx(fd, false) else {
                continue;
            };
            if mask & libc::EPOLLIN as u32 != 0 {
                if let Some(fiber) = self.take_waiter(&ctx, Event::Read) {
                    self.sched.schedule(fiber);
                }
            }
            if mask & libc::EPOLLOUT as u32 != 0 {
                if let Some(fiber) = self.take_waiter(&ctx, Event::Write) {
                    self.sched.schedule(fiber);
                }
            }
        }
    }
}

/// Scheduler idler backed by the manager's epoll instance.
struct EpollIdler {
    iom: Weak<IoManager>,
}

impl Idler for EpollIdler {
    fn idle(&self, timeout: Option<Duration>) {
        match self.iom.upgrade() {
            Some(iom) => iom.poll(timeout),
            // Manager torn down; don't busy-spin the surviving workers.
            None => std::thread::sleep(
                timeout
                    .unwrap_or(Duration::from_millis(10))
                    .min(Duration::from_millis(10)),
            ),
        }
    }

    fn notify(&self) {
        if let Some(iom) = self.iom.upgrade() {
            iom.tickler.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_runtime::block_current;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Instant;

    fn io(workers: usize) -> Arc<IoManager> {
        IoManager::new(
            RuntimeConfig::new()
                .name("iom-test")
                .workers(workers)
                .idle_timeout(Duration::from_millis(50)),
        )
        .expect("iomanager")
    }

    fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn socketpair() -> (libc::c_int, libc::c_int) {
        let mut fds = [0 as libc::c_int; 2];
        let rt = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_workers_are_bound_and_hooked() {
        let iom = io(1);
        let ok = Arc::new(AtomicBool::new(false));

        {
            let ok = ok.clone();
            iom.spawn(move || {
                let bound = IoManager::current().is_some();
                let hooked = crate::hook::is_enabled();
                ok.store(bound && hooked, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| ok.load(Ordering::SeqCst), "fiber to observe TLS");
        // The test thread itself is not a worker.
        assert!(IoManager::current().is_none());
        assert!(!crate::hook::is_enabled());
        iom.stop();
    }

    #[test]
    fn test_readiness_resumes_waiter() {
        let iom = io(2);
        let (a, b) = socketpair();
        let resumed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        {
            let iom2 = Arc::clone(&iom);
            let resumed = resumed.clone();
            iom.spawn(move || {
                iom2.add_event(a, Event::Read).unwrap();
                tx.send(()).unwrap();
                block_current();
                resumed.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }

        rx.recv().unwrap();
        assert_eq!(iom.pending_events(), 1);
        assert!(!resumed.load(Ordering::SeqCst));

        let rt = unsafe { libc::write(b, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(rt, 1);

        wait_until(|| resumed.load(Ordering::SeqCst), "reader to resume");
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_cancel_event_resumes_exactly_once() {
        let iom = io(2);
        let (a, b) = socketpair();
        let resumed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        {
            let iom2 = Arc::clone(&iom);
            let resumed = resumed.clone();
            iom.spawn(move || {
                iom2.add_event(a, Event::Read).unwrap();
                tx.send(()).unwrap();
                block_current();
                resumed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        rx.recv().unwrap();
        assert!(iom.cancel_event(a, Event::Read));
        wait_until(|| resumed.load(Ordering::SeqCst) == 1, "forced resume");

        // Nothing pending anymore: both report no-op.
        assert!(!iom.cancel_event(a, Event::Read));
        assert_eq!(iom.cancel_all(a), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(resumed.load(Ordering::SeqCst), 1);

        iom.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_second_waiter_is_rejected() {
        let iom = io(2);
        let (a, b) = socketpair();
        let (tx, rx) = mpsc::channel();
        let second = Arc::new(AtomicBool::new(false));

        {
            let iom2 = Arc::clone(&iom);
            iom.spawn(move || {
                iom2.add_event(a, Event::Read).unwrap();
                tx.send(()).unwrap();
                block_current();
            })
            .unwrap();
        }
        rx.recv().unwrap();

        {
            let iom2 = Arc::clone(&iom);
            let second = second.clone();
            iom.spawn(move || {
                let err = iom2.add_event(a, Event::Read).unwrap_err();
                assert!(matches!(err, IoError::EventExists { .. }));
                assert_eq!(err.errno(), libc::EEXIST);
                second.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| second.load(Ordering::SeqCst), "second fiber rejected");
        assert!(iom.cancel_event(a, Event::Read));

        iom.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_cancel_all_fires_both_directions() {
        let iom = io(2);
        let (a, b) = socketpair();
        // Fill the send buffer? Not needed: the write waiter is armed
        // manually, readiness for it may also fire, either path resumes it.
        let resumed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        {
            let iom2 = Arc::clone(&iom);
            let resumed = resumed.clone();
            iom.spawn(move || {
                iom2.add_event(a, Event::Read).unwrap();
                tx.send(()).unwrap();
                block_current();
                resumed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        rx.recv().unwrap();

        let fired = iom.cancel_all(a);
        assert_eq!(fired, 1);
        wait_until(|| resumed.load(Ordering::SeqCst) == 1, "cancelled reader");

        iom.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
