//! File descriptor context table
//!
//! Process-wide metadata for descriptors the hook layer has observed: whether
//! the fd is a socket, the kernel-side vs user-side non-blocking split, and
//! per-direction timeouts.
//!
//! Kernel-side initialization is lazy: creating a context records nothing;
//! the first accessor `fstat`s the fd and, for sockets, forces `O_NONBLOCK`
//! on the kernel fd while the user-visible view stays blocking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock, RwLock};

/// Sentinel for "no timeout configured".
pub const TIMEOUT_NONE: u64 = u64::MAX;

/// Which direction's timeout to consult (SO_RCVTIMEO vs SO_SNDTIMEO).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Per-descriptor context.
///
/// Invariant: for a live socket with `user_nonblock` unset, `sys_nonblock`
/// is true once initialized — the kernel fd never blocks, the hook layer
/// simulates blocking by parking the fiber.
pub struct FdCtx {
    fd: libc::c_int,
    init: Once,
    is_socket: AtomicBool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: libc::c_int) -> Self {
        Self {
            fd,
            init: Once::new(),
            is_socket: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
            send_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
        }
    }

    fn ensure_init(&self) {
        self.init.call_once(|| {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            let rt = unsafe { libc::fstat(self.fd, &mut st) };
            if rt != 0 {
                return;
            }
            let is_sock = (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
            self.is_socket.store(is_sock, Ordering::Release);

            if is_sock {
                let real = crate::hook::real::fns();
                let flags = unsafe { (real.fcntl)(self.fd, libc::F_GETFL, 0) };
                if flags >= 0 && (flags & libc::O_NONBLOCK) == 0 {
                    unsafe { (real.fcntl)(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                }
                self.sys_nonblock.store(true, Ordering::Release);
            }
        });
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    /// Whether the fd is a socket (triggers lazy init).
    pub fn is_socket(&self) -> bool {
        self.ensure_init();
        self.is_socket.load(Ordering::Acquire)
    }

    /// Whether the runtime forced O_NONBLOCK on the kernel fd.
    pub fn sys_nonblock(&self) -> bool {
        self.ensure_init();
        self.sys_nonblock.load(Ordering::Acquire)
    }

    /// Whether the application asked for non-blocking mode.
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Configured timeout for `kind`, `TIMEOUT_NONE` when unset.
    pub fn timeout_ms(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

impl std::fmt::Debug for FdCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdCtx")
            .field("fd", &self.fd)
            .field("closed", &self.is_closed())
            .field("user_nonblock", &self.user_nonblock())
            .finish()
    }
}

/// Process-wide fd -> context table.
///
/// At most one live context exists per fd; lookups are stable until `del`.
pub struct FdMgr {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdMgr {
    fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::with_capacity(64)),
        }
    }

    /// The process-wide instance.
    pub fn instance() -> &'static FdMgr {
        static INSTANCE: OnceLock<FdMgr> = OnceLock::new();
        INSTANCE.get_or_init(FdMgr::new)
    }

    /// Look up the context for `fd`, creating one when `auto_create` is set.
    ///
    /// A context already marked closed is replaced on auto-create (the fd
    /// number has been recycled), and returned as-is otherwise so callers
    /// observe EBADF without touching the kernel.
    pub fn get(&self, fd: libc::c_int, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(idx) {
                if !(auto_create && ctx.is_closed()) {
                    return Some(ctx.clone());
                }
            } else if !auto_create {
                return None;
            }
        }
        if !auto_create {
            return None;
        }

        let mut slots = self.slots.write().unwrap();
        if slots.len() <= idx {
            slots.resize(idx + 1, None);
        }
        match &slots[idx] {
            Some(ctx) if !ctx.is_closed() => Some(ctx.clone()),
            _ => {
                let ctx = Arc::new(FdCtx::new(fd));
                slots[idx] = Some(ctx.clone());
                Some(ctx)
            }
        }
    }

    /// Drop the context for `fd`, marking it closed for concurrent holders.
    pub fn del(&self, fd: libc::c_int) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let mut slots = self.slots.write().unwrap();
        let ctx = slots.get_mut(fd as usize).and_then(|slot| slot.take());
        if let Some(ctx) = &ctx {
            ctx.mark_closed();
        }
        ctx
    }
}
