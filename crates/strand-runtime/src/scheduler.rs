//! Cooperative fiber scheduler
//!
//! A pool of OS worker threads sharing one ready queue and one timer queue.
//! Within a worker, execution is single-threaded cooperative: one fiber runs
//! until it yields, parks or completes. Workers with nothing to run hand
//! control to the `Idler` (condvar parking by default, epoll in strand-io)
//! until the next timer deadline or an external wakeup.

use crate::config::RuntimeConfig;
use crate::fiber::Fiber;
use crate::park::ParkIdler;
use crate::timer::{TimerCondition, TimerId, TimerQueue};
use crate::tls;
use crate::arch::{self, SavedContext};

use strand_core::{fdebug, fwarn, FiberId, FiberState, RuntimeError, RuntimeResult};

use crossbeam_queue::SegQueue;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Seam between the scheduler and its wakeup mechanism.
///
/// `idle` blocks the calling worker until work may be available or `timeout`
/// elapses; `notify` wakes at least one idling worker. Implementations must
/// tolerate spurious wakeups on both sides.
pub trait Idler: Send + Sync {
    fn idle(&self, timeout: Option<Duration>);
    fn notify(&self);
}

/// Per-thread hook run once on every worker before it schedules fibers.
pub type ThreadInit = Arc<dyn Fn(usize) + Send + Sync>;

/// Cooperative scheduler over a worker thread pool.
pub struct Scheduler {
    config: RuntimeConfig,

    /// Runnable fibers. Push only after the context is saved.
    ready: SegQueue<Arc<Fiber>>,

    /// Shared deadline queue (sleeps, I/O timeouts).
    timers: TimerQueue,

    /// Wakeup mechanism; replaced by strand-io before start.
    idler: RwLock<Arc<dyn Idler>>,

    /// Optional per-worker setup (TLS binding, hook enable).
    thread_init: Mutex<Option<ThreadInit>>,

    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopping: AtomicBool,

    /// Fibers spawned and not yet finished.
    live_fibers: AtomicUsize,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            ready: SegQueue::new(),
            timers: TimerQueue::new(),
            idler: RwLock::new(Arc::new(ParkIdler::new())),
            thread_init: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            live_fibers: AtomicUsize::new(0),
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Replace the idle/wakeup mechanism. Must happen before `start`.
    pub fn set_idler(&self, idler: Arc<dyn Idler>) {
        *self.idler.write().unwrap() = idler;
    }

    /// Install a per-worker setup hook. Must happen before `start`.
    pub fn set_thread_init(&self, init: ThreadInit) {
        *self.thread_init.lock().unwrap() = Some(init);
    }

    fn idler(&self) -> Arc<dyn Idler> {
        self.idler.read().unwrap().clone()
    }

    /// Spawn the worker threads.
    pub fn start(self: &Arc<Self>) -> RuntimeResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyStarted);
        }

        let mut workers = self.workers.lock().unwrap();
        for i in 0..self.config.workers {
            let sched = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{}", self.config.name, i))
                .spawn(move || sched.worker_loop(i))
                .map_err(|_| RuntimeError::Os(libc::EAGAIN))?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Create a fiber running `f` and make it runnable.
    pub fn spawn<F>(&self, f: F) -> RuntimeResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Fiber::new(self.config.stack_size, Box::new(f))?;
        let id = fiber.id();
        self.live_fibers.fetch_add(1, Ordering::AcqRel);
        self.schedule(fiber);
        Ok(id)
    }

    /// Make a fiber runnable again.
    ///
    /// This is the single wakeup path: timers, readiness events and explicit
    /// cancels all land here. A wakeup that catches the fiber before its
    /// context is saved latches as `Notified` instead of queueing, so a
    /// half-saved fiber can never be resumed on another worker.
    pub fn schedule(&self, fiber: Arc<Fiber>) {
        loop {
            match fiber.state() {
                FiberState::Blocked => {
                    if fiber.cas_state(FiberState::Blocked, FiberState::Ready) {
                        self.ready.push(fiber);
                        self.idler().notify();
                        return;
                    }
                }
                FiberState::Parking => {
                    // The owning worker queues it after the context save.
                    if fiber.cas_state(FiberState::Parking, FiberState::Notified) {
                        return;
                    }
                }
                FiberState::Running => {
                    // Latched; block_current consumes it without switching.
                    if fiber.cas_state(FiberState::Running, FiberState::Notified) {
                        return;
                    }
                }
                FiberState::Created => {
                    if fiber.cas_state(FiberState::Created, FiberState::Ready) {
                        self.ready.push(fiber);
                        self.idler().notify();
                        return;
                    }
                }
                FiberState::Ready | FiberState::Notified | FiberState::Finished => return,
            }
        }
    }

    /// Queue a one-shot timer.
    pub fn add_timer(&self, delay: Duration, cb: Box<dyn FnOnce() + Send>) -> TimerId {
        let (id, at_front) = self.timers.add(delay, cb);
        if at_front {
            self.idler().notify();
        }
        id
    }

    /// Queue a condition timer (no-op at expiry if `cond` is dead).
    pub fn add_condition_timer(
        &self,
        delay: Duration,
        cb: Box<dyn FnOnce() + Send>,
        cond: TimerCondition,
    ) -> TimerId {
        let (id, at_front) = self.timers.add_condition(delay, cb, cond);
        if at_front {
            self.idler().notify();
        }
        id
    }

    /// Cancel a queued timer; idempotent.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Fibers spawned and not yet finished.
    pub fn live_fibers(&self) -> usize {
        self.live_fibers.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Request shutdown and join the workers.
    ///
    /// Workers exit once no fibers remain alive; must be called from outside
    /// the scheduler's own threads.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let idler = self.idler();
        for _ in 0..self.config.workers {
            idler.notify();
        }

        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }

    fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tls::set_worker_id(worker_id);
        let init = self.thread_init.lock().unwrap().clone();
        if let Some(init) = init {
            init(worker_id);
        }
        fdebug!("{}-worker-{} started", self.config.name, worker_id);

        let mut sched_ctx = SavedContext::zeroed();
        tls::set_sched_context(&mut sched_ctx);

        loop {
            for cb in self.timers.tick(Instant::now()) {
                cb();
            }

            if let Some(fiber) = self.ready.pop() {
                self.run_fiber(fiber);
                continue;
            }

            if self.stopping.load(Ordering::Acquire)
                && self.live_fibers.load(Ordering::Acquire) == 0
            {
                break;
            }

            let timeout = self
                .timers
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(self.config.idle_timeout)
                .min(self.config.idle_timeout);
            self.idler().idle(Some(timeout));
        }

        tls::set_sched_context(std::ptr::null_mut());
        fdebug!("{}-worker-{} exiting", self.config.name, worker_id);
    }

    /// Switch into a ready fiber and handle whatever state it left behind.
    fn run_fiber(&self, fiber: Arc<Fiber>) {
        tls::set_current_fiber(Arc::as_ptr(&fiber));
        fiber.set_state(FiberState::Running);

        let sched_ctx = tls::sched_context();
        unsafe {
            arch::switch_context(sched_ctx, fiber.regs_ptr());
        }

        tls::clear_current_fiber();

        // The fiber's context is saved from here on; queueing it is safe.
        match fiber.state() {
            FiberState::Ready => {
                // Voluntary yield.
                self.ready.push(fiber);
            }
            FiberState::Parking => {
                if !fiber.cas_state(FiberState::Parking, FiberState::Blocked) {
                    // A wakeup latched while the fiber was parking.
                    fiber.set_state(FiberState::Ready);
                    self.ready.push(fiber);
                }
            }
            FiberState::Notified => {
                fiber.set_state(FiberState::Ready);
                self.ready.push(fiber);
            }
            FiberState::Finished => {
                self.live_fibers.fetch_sub(1, Ordering::AcqRel);
                if self.stopping.load(Ordering::Acquire) {
                    self.idler().notify();
                }
            }
            other => {
                fwarn!("fiber {} left in unexpected state {}", fiber.id(), other);
            }
        }
    }
}
