//! Syscall hook layer
//!
//! POSIX-shaped entry points that turn blocking calls issued by fiber code
//! into non-blocking kernel invocations plus fiber suspension. Each hooked
//! call:
//!
//! 1. falls through to the real implementation when the per-thread enable
//!    flag is off (non-worker threads, init code),
//! 2. otherwise attempts the raw syscall on the kernel-side non-blocking fd,
//! 3. on would-block registers a readiness event (and an optional timeout
//!    timer) with the thread's IoManager and parks the fiber,
//! 4. resumes with the POSIX-faithful (result, errno) pair: success, a
//!    retried call, `ETIMEDOUT`, or the cancellation errno.
//!
//! Return values and errno are preserved bit-for-bit for the non-suspending
//! paths; short reads/writes are returned unchanged.

use crate::error::IoResult;
use crate::event::Event;
use crate::fd_mgr::{FdMgr, TimeoutKind, TIMEOUT_NONE};
use crate::iomanager::IoManager;

use strand_core::settings;
use strand_core::{ferror, finfo};
use strand_runtime::timer::{TimerCondition, TimerId};
use strand_runtime::{block_current, Fiber};

use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};

use std::cell::Cell;

/// Linux fcntl owner-signal extensions. Omitted from the `libc` crate for
/// glibc targets (historical ABI-alignment concerns); values and layout
/// match the kernel's `<linux/fcntl.h>` / `<bits/fcntl-linux.h>` exactly.
mod fcntl_ext {
    use libc::{c_int, pid_t};

    pub const F_SETSIG: c_int = 10;
    pub const F_GETSIG: c_int = 11;
    pub const F_SETOWN_EX: c_int = 15;
    pub const F_GETOWN_EX: c_int = 16;

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct f_owner_ex {
        pub type_: c_int,
        pub pid: pid_t,
    }
}
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::Duration;

// ── Real implementations ─────────────────────────────────────────────

pub(crate) mod real {
    //! Pointers to the next-resolved implementations of every intercepted
    //! entry point, looked up once via `dlsym(RTLD_NEXT)`. When the lookup
    //! comes back empty (statically linked, no next object) the direct libc
    //! symbol is used instead, which keeps the crate usable both called
    //! directly and as the body of an LD_PRELOAD shim.

    use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
    use std::sync::OnceLock;

    macro_rules! real_table {
        ($(fn $name:ident: $ty:ty = $fallback:path;)*) => {
            pub(crate) struct RealFns {
                $(pub $name: $ty,)*
            }

            fn resolve() -> RealFns {
                RealFns {
                    $($name: {
                        let sym = unsafe {
                            libc::dlsym(
                                libc::RTLD_NEXT,
                                concat!(stringify!($name), "\0").as_ptr()
                                    as *const libc::c_char,
                            )
                        };
                        if sym.is_null() {
                            $fallback as $ty
                        } else {
                            unsafe { std::mem::transmute::<*mut c_void, $ty>(sym) }
                        }
                    },)*
                }
            }
        };
    }

    real_table! {
        fn sleep: unsafe extern "C" fn(c_uint) -> c_uint = libc::sleep;
        fn usleep: unsafe extern "C" fn(c_uint) -> c_int = libc::usleep;
        fn nanosleep: unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> c_int = libc::nanosleep;
        fn socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int = libc::socket;
        fn connect: unsafe extern "C" fn(c_int, *const libc::sockaddr, socklen_t) -> c_int = libc::connect;
        fn accept: unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut socklen_t) -> c_int = libc::accept;
        fn read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t = libc::read;
        fn readv: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t = libc::readv;
        fn recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t = libc::recv;
        fn recvfrom: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut libc::sockaddr, *mut socklen_t) -> ssize_t = libc::recvfrom;
        fn recvmsg: unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> ssize_t = libc::recvmsg;
        fn write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t = libc::write;
        fn writev: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t = libc::writev;
        fn send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t = libc::send;
        fn sendto: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const libc::sockaddr, socklen_t) -> ssize_t = libc::sendto;
        fn sendmsg: unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> ssize_t = libc::sendmsg;
        fn close: unsafe extern "C" fn(c_int) -> c_int = libc::close;
        fn fcntl: unsafe extern "C" fn(c_int, c_int, ...) -> c_int = libc::fcntl;
        fn ioctl: unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int = libc::ioctl;
        fn getsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int = libc::getsockopt;
        fn setsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int = libc::setsockopt;
    }

    pub(crate) fn fns() -> &'static RealFns {
        static REAL: OnceLock<RealFns> = OnceLock::new();
        REAL.get_or_init(resolve)
    }
}

// ── Per-thread enable flag ───────────────────────────────────────────

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether hooked calls on this thread take the fiber-suspending path.
#[inline]
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Flip the per-thread hook flag. IoManager workers turn it on; main and
/// init threads leave it off so every call falls through unchanged.
pub fn set_enabled(on: bool) {
    ensure_init();
    HOOK_ENABLED.with(|c| c.set(on));
}

// ── Connect timeout setting ──────────────────────────────────────────

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5000);
static INIT: Once = Once::new();

fn setting_to_ms(v: i64) -> u64 {
    if v < 0 {
        TIMEOUT_NONE
    } else {
        v as u64
    }
}

fn ensure_init() {
    INIT.call_once(|| {
        let var = settings::int_var(
            "tcp.connect.timeout",
            5000,
            "default connect timeout in milliseconds (-1 = none)",
        );
        CONNECT_TIMEOUT_MS.store(setting_to_ms(var.get()), Ordering::Relaxed);
        var.on_change(|old, new| {
            finfo!("tcp connect timeout changed from {} to {}", old, new);
            CONNECT_TIMEOUT_MS.store(setting_to_ms(new), Ordering::Relaxed);
        });
    });
}

/// Current default connect timeout (ms, `TIMEOUT_NONE` = none).
pub(crate) fn connect_timeout_ms() -> u64 {
    ensure_init();
    CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

// ── errno plumbing ───────────────────────────────────────────────────

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(v: c_int) {
    unsafe { *libc::__errno_location() = v }
}

// ── Shared timeout state ─────────────────────────────────────────────

/// Record shared between a suspended fiber and its timeout callback.
///
/// The fiber owns the strong reference on its stack frame; the timer holds
/// only a weak one, so a timer that fires after the I/O completed upgrades
/// nothing and does nothing.
#[derive(Default)]
struct TimerInfo {
    /// 0 while live; otherwise the errno the fiber must surface.
    cancelled: AtomicI32,
}

/// Arm a condition timer that cancels `(fd, event)` with ETIMEDOUT.
fn arm_timeout(
    iom: &Arc<IoManager>,
    fd: c_int,
    event: Event,
    timeout_ms: u64,
    tinfo: &Arc<TimerInfo>,
) -> Option<TimerId> {
    if timeout_ms == TIMEOUT_NONE {
        return None;
    }
    let winfo = Arc::downgrade(tinfo);
    let cond: TimerCondition = winfo.clone();
    let iom_w: Weak<IoManager> = Arc::downgrade(iom);

    Some(iom.add_condition_timer(
        Duration::from_millis(timeout_ms),
        move || {
            let Some(t) = winfo.upgrade() else {
                return;
            };
            if t.cancelled.load(Ordering::Acquire) != 0 {
                return;
            }
            t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
            if let Some(iom) = iom_w.upgrade() {
                iom.cancel_event(fd, event);
            }
        },
        cond,
    ))
}

// ── Generic blocking-I/O driver ──────────────────────────────────────

/// Drive one blocking-style I/O call to completion.
///
/// `fun` performs the raw call on the (kernel-side non-blocking) fd; this
/// wrapper supplies the EINTR retry, the EAGAIN suspend/resume cycle, and
/// the timeout surface. `EAGAIN` itself is never returned to a caller that
/// didn't ask for non-blocking mode.
pub(crate) fn do_io<F>(
    fd: c_int,
    mut fun: F,
    name: &'static str,
    event: Event,
    timeout_kind: TimeoutKind,
) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_enabled() {
        return fun();
    }
    let Some(ctx) = FdMgr::instance().get(fd, false) else {
        return fun();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return fun();
    }

    let timeout_ms = ctx.timeout_ms(timeout_kind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        let mut n = fun();
        while n == -1 && errno() == libc::EINTR {
            n = fun();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would block: suspend until readiness or timeout.
        let Some(iom) = IoManager::current() else {
            return n;
        };

        let timer = arm_timeout(&iom, fd, event, timeout_ms, &tinfo);

        if let Err(e) = iom.add_event(fd, event) {
            ferror!("{}: add_event({}, {}) failed: {}", name, fd, event, e);
            if let Some(t) = timer {
                iom.cancel_timer(t);
            }
            set_errno(e.errno());
            return -1;
        }

        block_current();

        if let Some(t) = timer {
            iom.cancel_timer(t);
        }
        let cancelled = tinfo.cancelled.load(Ordering::Acquire);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Resumed by readiness; try the call again.
    }
}

// ── Sleep family ─────────────────────────────────────────────────────

fn fiber_sleep(delay: Duration) -> IoResult<()> {
    let fiber = Fiber::current().ok_or(crate::error::IoError::NotInFiber)?;
    let iom = IoManager::current().ok_or(crate::error::IoError::NotInFiber)?;

    let iom_w: Weak<IoManager> = Arc::downgrade(&iom);
    iom.add_timer(delay, move || {
        if let Some(iom) = iom_w.upgrade() {
            iom.schedule(fiber);
        }
    });
    block_current();
    Ok(())
}

pub fn sleep(seconds: c_uint) -> c_uint {
    if !is_enabled() {
        return unsafe { (real::fns().sleep)(seconds) };
    }
    match fiber_sleep(Duration::from_millis(seconds as u64 * 1000)) {
        Ok(()) => 0,
        Err(_) => unsafe { (real::fns().sleep)(seconds) },
    }
}

pub fn usleep(usec: c_uint) -> c_int {
    if !is_enabled() {
        return unsafe { (real::fns().usleep)(usec) };
    }
    match fiber_sleep(Duration::from_millis(usec as u64 / 1000)) {
        Ok(()) => 0,
        Err(_) => unsafe { (real::fns().usleep)(usec) },
    }
}

pub fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !is_enabled() || req.is_null() {
        return unsafe { (real::fns().nanosleep)(req, rem) };
    }
    let (sec, nsec) = unsafe { ((*req).tv_sec, (*req).tv_nsec) };
    let ms = sec as u64 * 1000 + nsec as u64 / 1_000_000;

    match fiber_sleep(Duration::from_millis(ms)) {
        Ok(()) => {
            // The full request elapsed; nothing remains.
            if !rem.is_null() {
                unsafe {
                    (*rem).tv_sec = 0;
                    (*rem).tv_nsec = 0;
                }
            }
            0
        }
        Err(_) => unsafe { (real::fns().nanosleep)(req, rem) },
    }
}

// ── Socket lifecycle ─────────────────────────────────────────────────

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !is_enabled() {
        return unsafe { (real::fns().socket)(domain, ty, protocol) };
    }
    let fd = unsafe { (real::fns().socket)(domain, ty, protocol) };
    if fd >= 0 {
        FdMgr::instance().get(fd, true);
    }
    fd
}

/// `connect` with an explicit timeout (`TIMEOUT_NONE` = wait forever).
pub fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_enabled() {
        return unsafe { (real::fns().connect)(fd, addr, addrlen) };
    }
    let ctx = FdMgr::instance().get(fd, false);
    let Some(ctx) = ctx else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { (real::fns().connect)(fd, addr, addrlen) };
    }

    let n = unsafe { (real::fns().connect)(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        return n;
    };

    let tinfo = Arc::new(TimerInfo::default());
    let timer = arm_timeout(&iom, fd, Event::Write, timeout_ms, &tinfo);

    if let Err(e) = iom.add_event(fd, Event::Write) {
        ferror!("connect: add_event({}, WRITE) failed: {}", fd, e);
        if let Some(t) = timer {
            iom.cancel_timer(t);
        }
        set_errno(e.errno());
        return -1;
    }

    block_current();

    if let Some(t) = timer {
        iom.cancel_timer(t);
    }
    let cancelled = tinfo.cancelled.load(Ordering::Acquire);
    if cancelled != 0 {
        set_errno(cancelled);
        return -1;
    }

    // Writable: the three-way handshake finished one way or the other.
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rt = unsafe {
        (real::fns().getsockopt)(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if rt == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

pub fn connect(sockfd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, connect_timeout_ms())
}

pub fn accept(s: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(
        s,
        || unsafe { (real::fns().accept)(s, addr, addrlen) as ssize_t },
        "accept",
        Event::Read,
        TimeoutKind::Recv,
    ) as c_int;
    if fd >= 0 {
        FdMgr::instance().get(fd, true);
    }
    fd
}

pub fn close(fd: c_int) -> c_int {
    if !is_enabled() {
        return unsafe { (real::fns().close)(fd) };
    }
    if FdMgr::instance().get(fd, false).is_some() {
        // Wake anything parked on this fd so it surfaces the failure, then
        // drop the context before the kernel fd goes away.
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        FdMgr::instance().del(fd);
    }
    unsafe { (real::fns().close)(fd) }
}

// ── Data-path wrappers ───────────────────────────────────────────────

pub fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(
        fd,
        || unsafe { (real::fns().read)(fd, buf, count) },
        "read",
        Event::Read,
        TimeoutKind::Recv,
    )
}

pub fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(
        fd,
        || unsafe { (real::fns().readv)(fd, iov, iovcnt) },
        "readv",
        Event::Read,
        TimeoutKind::Recv,
    )
}

pub fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { (real::fns().recv)(sockfd, buf, len, flags) },
        "recv",
        Event::Read,
        TimeoutKind::Recv,
    )
}

pub fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { (real::fns().recvfrom)(sockfd, buf, len, flags, src_addr, addrlen) },
        "recvfrom",
        Event::Read,
        TimeoutKind::Recv,
    )
}

pub fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { (real::fns().recvmsg)(sockfd, msg, flags) },
        "recvmsg",
        Event::Read,
        TimeoutKind::Recv,
    )
}

pub fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(
        fd,
        || unsafe { (real::fns().write)(fd, buf, count) },
        "write",
        Event::Write,
        TimeoutKind::Send,
    )
}

pub fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(
        fd,
        || unsafe { (real::fns().writev)(fd, iov, iovcnt) },
        "writev",
        Event::Write,
        TimeoutKind::Send,
    )
}

pub fn send(s: c_int, msg: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(
        s,
        || unsafe { (real::fns().send)(s, msg, len, flags) },
        "send",
        Event::Write,
        TimeoutKind::Send,
    )
}

pub fn sendto(
    s: c_int,
    msg: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const libc::sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(
        s,
        || unsafe { (real::fns().sendto)(s, msg, len, flags, to, tolen) },
        "sendto",
        Event::Write,
        TimeoutKind::Send,
    )
}

pub fn sendmsg(s: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(
        s,
        || unsafe { (real::fns().sendmsg)(s, msg, flags) },
        "sendmsg",
        Event::Write,
        TimeoutKind::Send,
    )
}

// ── fcntl / ioctl / sockopts ─────────────────────────────────────────

/// Argument shapes for [`fcntl`], dispatched on the command code.
///
/// Stable Rust cannot define C-variadic functions, so the one variadic POSIX
/// signature becomes an enum; a shim layer doing real symbol interposition
/// owns the `va_arg` unpacking and builds the right variant per command.
#[derive(Debug, Clone, Copy)]
pub enum FcntlArg {
    None,
    Int(c_int),
    Lock(*mut libc::flock),
    OwnerEx(*mut fcntl_ext::f_owner_ex),
}

fn fcntl_forward(fd: c_int, cmd: c_int, arg: FcntlArg) -> c_int {
    let real = real::fns();
    unsafe {
        match arg {
            FcntlArg::None => (real.fcntl)(fd, cmd),
            FcntlArg::Int(v) => (real.fcntl)(fd, cmd, v),
            FcntlArg::Lock(p) => (real.fcntl)(fd, cmd, p),
            FcntlArg::OwnerEx(p) => (real.fcntl)(fd, cmd, p),
        }
    }
}

pub fn fcntl(fd: c_int, cmd: c_int, arg: FcntlArg) -> c_int {
    if !is_enabled() {
        return fcntl_forward(fd, cmd, arg);
    }

    match cmd {
        libc::F_SETFL => {
            let FcntlArg::Int(mut flags) = arg else {
                set_errno(libc::EINVAL);
                return -1;
            };
            match FdMgr::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    // Record the user's wish, but keep the kernel fd in the
                    // runtime's non-blocking mode.
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    unsafe { (real::fns().fcntl)(fd, cmd, flags) }
                }
                _ => fcntl_forward(fd, cmd, FcntlArg::Int(flags)),
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { (real::fns().fcntl)(fd, cmd) };
            if flags < 0 {
                return flags;
            }
            match FdMgr::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    // Round-trip the user's view, not the kernel's.
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        libc::F_DUPFD
        | libc::F_DUPFD_CLOEXEC
        | libc::F_SETFD
        | libc::F_SETOWN
        | fcntl_ext::F_SETSIG
        | libc::F_SETLEASE
        | libc::F_NOTIFY
        | libc::F_SETPIPE_SZ => match arg {
            FcntlArg::Int(_) => fcntl_forward(fd, cmd, arg),
            _ => {
                set_errno(libc::EINVAL);
                -1
            }
        },
        libc::F_GETFD | libc::F_GETOWN | fcntl_ext::F_GETSIG | libc::F_GETLEASE | libc::F_GETPIPE_SZ => {
            match arg {
                FcntlArg::None => fcntl_forward(fd, cmd, arg),
                _ => {
                    set_errno(libc::EINVAL);
                    -1
                }
            }
        }
        libc::F_SETLK | libc::F_SETLKW | libc::F_GETLK => match arg {
            FcntlArg::Lock(_) => fcntl_forward(fd, cmd, arg),
            _ => {
                set_errno(libc::EINVAL);
                -1
            }
        },
        fcntl_ext::F_GETOWN_EX | fcntl_ext::F_SETOWN_EX => match arg {
            FcntlArg::OwnerEx(_) => fcntl_forward(fd, cmd, arg),
            _ => {
                set_errno(libc::EINVAL);
                -1
            }
        },
        _ => fcntl_forward(fd, cmd, arg),
    }
}

pub fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if is_enabled() && request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let user_nonblock = unsafe { *(arg as *const c_int) } != 0;
        if let Some(ctx) = FdMgr::instance().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { (real::fns().ioctl)(fd, request, arg) }
}

pub fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { (real::fns().getsockopt)(sockfd, level, optname, optval, optlen) }
}

/// Millisecond view of a `timeval` timeout. Zero means "no timeout" per
/// POSIX; sub-millisecond values round up so they can never become the
/// no-timeout sentinel by truncation.
fn timeval_to_ms(tv: &libc::timeval) -> u64 {
    if tv.tv_sec <= 0 && tv.tv_usec <= 0 {
        return TIMEOUT_NONE;
    }
    let ms = tv.tv_sec.max(0) as u64 * 1000 + tv.tv_usec.max(0) as u64 / 1000;
    ms.max(1)
}

pub fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if !is_enabled() {
        return unsafe { (real::fns().setsockopt)(sockfd, level, optname, optval, optlen) };
    }

    if level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = FdMgr::instance().get(sockfd, false) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout_ms(kind, timeval_to_ms(tv));
        }
    }
    unsafe { (real::fns().setsockopt)(sockfd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_runtime::RuntimeConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::mpsc;
    use std::time::Instant;

    fn io(workers: usize) -> Arc<IoManager> {
        IoManager::new(
            RuntimeConfig::new()
                .name("hook-test")
                .workers(workers)
                .idle_timeout(Duration::from_millis(50)),
        )
        .expect("iomanager")
    }

    fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn socketpair() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        let rt =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    fn loopback_addr(port: u16) -> libc::sockaddr_in {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
        addr
    }

    #[test]
    fn test_usleep_parks_fiber_and_others_progress() {
        let iom = io(2);
        let quick_done_at = Arc::new(std::sync::Mutex::new(None::<Instant>));
        let sleep_ok = Arc::new(AtomicBool::new(false));

        {
            let quick_done_at = quick_done_at.clone();
            iom.spawn(move || {
                *quick_done_at.lock().unwrap() = Some(Instant::now());
            })
            .unwrap();
        }
        {
            let quick_done_at = quick_done_at.clone();
            let sleep_ok = sleep_ok.clone();
            iom.spawn(move || {
                let start = Instant::now();
                let rt = usleep(100_000);
                let elapsed = start.elapsed();
                let quick = quick_done_at.lock().unwrap();
                let ok = rt == 0
                    && elapsed >= Duration::from_millis(95)
                    // The other fiber ran while this one was off-CPU.
                    && quick.map_or(false, |t| t < Instant::now());
                sleep_ok.store(ok, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| sleep_ok.load(Ordering::SeqCst), "hooked usleep");
        iom.stop();
    }

    #[test]
    fn test_nanosleep_populates_rem() {
        let iom = io(1);
        let ok = Arc::new(AtomicBool::new(false));

        {
            let ok = ok.clone();
            iom.spawn(move || {
                let req = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 50_000_000,
                };
                let mut rem = libc::timespec {
                    tv_sec: 7,
                    tv_nsec: 7,
                };
                let start = Instant::now();
                let rt = nanosleep(&req, &mut rem);
                ok.store(
                    rt == 0
                        && rem.tv_sec == 0
                        && rem.tv_nsec == 0
                        && start.elapsed() >= Duration::from_millis(45),
                    Ordering::SeqCst,
                );
            })
            .unwrap();
        }

        wait_until(|| ok.load(Ordering::SeqCst), "hooked nanosleep");
        iom.stop();
    }

    #[test]
    fn test_socket_installs_and_close_removes_ctx() {
        let iom = io(1);
        let ok = Arc::new(AtomicBool::new(false));

        {
            let ok = ok.clone();
            iom.spawn(move || {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                assert!(fd >= 0);
                let installed = FdMgr::instance().get(fd, false).is_some();
                assert_eq!(close(fd), 0);
                let removed = FdMgr::instance().get(fd, false).is_none();
                ok.store(installed && removed, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| ok.load(Ordering::SeqCst), "socket ctx lifecycle");
        iom.stop();
    }

    #[test]
    fn test_fcntl_round_trips_user_view() {
        let iom = io(1);
        let ok = Arc::new(AtomicBool::new(false));

        {
            let ok = ok.clone();
            iom.spawn(move || {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                let ctx = FdMgr::instance().get(fd, false).unwrap();
                // Force lazy init so the kernel fd is non-blocking.
                assert!(ctx.is_socket());

                let kernel_flags = unsafe { (real::fns().fcntl)(fd, libc::F_GETFL, 0) };
                assert_ne!(kernel_flags & libc::O_NONBLOCK, 0);

                // User view starts blocking.
                let flags = fcntl(fd, libc::F_GETFL, FcntlArg::None);
                assert_eq!(flags & libc::O_NONBLOCK, 0);

                // Set user non-blocking; view round-trips.
                assert!(fcntl(fd, libc::F_SETFL, FcntlArg::Int(flags | libc::O_NONBLOCK)) >= 0);
                let flags = fcntl(fd, libc::F_GETFL, FcntlArg::None);
                assert_ne!(flags & libc::O_NONBLOCK, 0);
                assert!(ctx.user_nonblock());

                // Clear it; the kernel fd stays non-blocking underneath.
                assert!(fcntl(fd, libc::F_SETFL, FcntlArg::Int(flags & !libc::O_NONBLOCK)) >= 0);
                let flags = fcntl(fd, libc::F_GETFL, FcntlArg::None);
                assert_eq!(flags & libc::O_NONBLOCK, 0);
                let kernel_flags = unsafe { (real::fns().fcntl)(fd, libc::F_GETFL, 0) };
                assert_ne!(kernel_flags & libc::O_NONBLOCK, 0);

                close(fd);
                ok.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| ok.load(Ordering::SeqCst), "fcntl round trip");
        iom.stop();
    }

    #[test]
    fn test_ioctl_fionbio_records_user_view() {
        let iom = io(1);
        let ok = Arc::new(AtomicBool::new(false));

        {
            let ok = ok.clone();
            iom.spawn(move || {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                let ctx = FdMgr::instance().get(fd, false).unwrap();
                assert!(ctx.is_socket());

                let mut on: c_int = 1;
                assert_eq!(ioctl(fd, libc::FIONBIO as c_ulong, &mut on as *mut c_int as *mut c_void), 0);
                assert!(ctx.user_nonblock());

                let mut off: c_int = 0;
                assert_eq!(ioctl(fd, libc::FIONBIO as c_ulong, &mut off as *mut c_int as *mut c_void), 0);
                assert!(!ctx.user_nonblock());

                close(fd);
                ok.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| ok.load(Ordering::SeqCst), "ioctl FIONBIO");
        iom.stop();
    }

    #[test]
    fn test_setsockopt_mirrors_timeouts() {
        let iom = io(1);
        let ok = Arc::new(AtomicBool::new(false));

        {
            let ok = ok.clone();
            iom.spawn(move || {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                let ctx = FdMgr::instance().get(fd, false).unwrap();

                let tv = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 150_000,
                };
                assert_eq!(
                    setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_RCVTIMEO,
                        &tv as *const libc::timeval as *const c_void,
                        std::mem::size_of::<libc::timeval>() as socklen_t,
                    ),
                    0
                );
                assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), 150);

                // Kernel round-trip (getsockopt is a pure pass-through).
                let mut out: libc::timeval = unsafe { std::mem::zeroed() };
                let mut len = std::mem::size_of::<libc::timeval>() as socklen_t;
                assert_eq!(
                    getsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_RCVTIMEO,
                        &mut out as *mut libc::timeval as *mut c_void,
                        &mut len,
                    ),
                    0
                );
                assert_eq!(out.tv_sec, 0);
                assert!(out.tv_usec >= 140_000 && out.tv_usec <= 160_000);

                // Sub-millisecond rounds up instead of collapsing to "none".
                let tv = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 500,
                };
                setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_SNDTIMEO,
                    &tv as *const libc::timeval as *const c_void,
                    std::mem::size_of::<libc::timeval>() as socklen_t,
                );
                assert_eq!(ctx.timeout_ms(TimeoutKind::Send), 1);

                // Zero means no timeout.
                let tv = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 0,
                };
                setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const libc::timeval as *const c_void,
                    std::mem::size_of::<libc::timeval>() as socklen_t,
                );
                assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), TIMEOUT_NONE);

                close(fd);
                ok.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| ok.load(Ordering::SeqCst), "setsockopt mirror");
        iom.stop();
    }

    #[test]
    fn test_read_times_out_then_socket_stays_usable() {
        let iom = io(2);
        let (a, b) = socketpair();
        let (tx, rx) = mpsc::channel();
        let done = Arc::new(AtomicBool::new(false));

        {
            let done = done.clone();
            iom.spawn(move || {
                // The pair never went through the socket() hook; adopt it.
                let ctx = FdMgr::instance().get(a, true).unwrap();
                assert!(ctx.is_socket());

                let tv = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 100_000,
                };
                setsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const libc::timeval as *const c_void,
                    std::mem::size_of::<libc::timeval>() as socklen_t,
                );

                let mut buf = [0u8; 8];
                let start = Instant::now();
                let n = read(a, buf.as_mut_ptr() as *mut c_void, buf.len());
                let e = errno();
                let elapsed = start.elapsed();
                assert_eq!(n, -1);
                assert_eq!(e, libc::ETIMEDOUT);
                assert!(elapsed >= Duration::from_millis(90));
                assert!(elapsed <= Duration::from_millis(2000));

                // Clear the deadline and read for real.
                let tv = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 0,
                };
                setsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const libc::timeval as *const c_void,
                    std::mem::size_of::<libc::timeval>() as socklen_t,
                );
                tx.send(()).unwrap();

                let n = read(a, buf.as_mut_ptr() as *mut c_void, buf.len());
                assert_eq!(n, 1);
                assert_eq!(buf[0], b'x');
                done.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }

        rx.recv().unwrap();
        let rt = unsafe { libc::write(b, b"x".as_ptr() as *const c_void, 1) };
        assert_eq!(rt, 1);

        wait_until(|| done.load(Ordering::SeqCst), "timed-out socket reuse");
        iom.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_close_wakes_pending_reader() {
        let iom = io(2);
        let (raw, b) = socketpair();
        // Park the reader on a high fd number so a parallel test can't
        // recycle it between our close and the reader's retry.
        let a = unsafe { libc::fcntl(raw, libc::F_DUPFD, 700) };
        assert!(a >= 700);
        unsafe { libc::close(raw) };
        let reader_errno = Arc::new(AtomicI32::new(0));
        let done = Arc::new(AtomicBool::new(false));

        {
            let reader_errno = reader_errno.clone();
            let done = done.clone();
            iom.spawn(move || {
                FdMgr::instance().get(a, true).unwrap();
                let mut buf = [0u8; 8];
                let n = read(a, buf.as_mut_ptr() as *mut c_void, buf.len());
                assert_eq!(n, -1);
                reader_errno.store(errno(), Ordering::SeqCst);
                done.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }
        {
            iom.spawn(move || {
                // Give the reader time to park, then yank the fd.
                usleep(50_000);
                close(a);
            })
            .unwrap();
        }

        wait_until(|| done.load(Ordering::SeqCst), "reader woken by close");
        assert_ne!(reader_errno.load(Ordering::SeqCst), 0);

        iom.stop();
        unsafe {
            libc::close(b);
        }
    }

    #[test]
    fn test_eintr_is_retried_without_yielding() {
        let (a, b) = socketpair();
        let rt = unsafe { libc::write(b, b"hi".as_ptr() as *const c_void, 2) };
        assert_eq!(rt, 2);

        set_enabled(true);
        FdMgr::instance().get(a, true).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut buf = [0u8; 8];
        let buf_ptr = buf.as_mut_ptr() as *mut c_void;

        let n = do_io(
            a,
            move || {
                if calls2.fetch_add(1, Ordering::SeqCst) == 0 {
                    set_errno(libc::EINTR);
                    return -1;
                }
                unsafe { (real::fns().recv)(a, buf_ptr, 8, 0) }
            },
            "recv",
            Event::Read,
            TimeoutKind::Recv,
        );
        set_enabled(false);

        assert_eq!(n, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(&buf[..2], b"hi");

        FdMgr::instance().del(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_read_after_close_is_ebadf() {
        let iom = io(1);
        let ok = Arc::new(AtomicBool::new(false));

        {
            let ok = ok.clone();
            iom.spawn(move || {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                assert_eq!(close(fd), 0);

                let mut buf = [0u8; 4];
                let n = read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
                ok.store(n == -1 && errno() == libc::EBADF, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| ok.load(Ordering::SeqCst), "EBADF after close");
        iom.stop();
    }

    #[test]
    fn test_connect_to_local_listener_succeeds() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let iom = io(1);
        let ok = Arc::new(AtomicBool::new(false));

        {
            let ok = ok.clone();
            iom.spawn(move || {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                let addr = loopback_addr(port);
                let rt = connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                );
                assert_eq!(rt, 0);

                let mut err: c_int = -1;
                let mut len = std::mem::size_of::<c_int>() as socklen_t;
                getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut c_int as *mut c_void,
                    &mut len,
                );
                close(fd);
                ok.store(err == 0, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| ok.load(Ordering::SeqCst), "hooked connect");
        iom.stop();
        drop(listener);
    }

    #[test]
    fn test_connect_times_out_against_blackhole() {
        let iom = io(1);
        let finished = Arc::new(AtomicBool::new(false));

        {
            let finished = finished.clone();
            iom.spawn(move || {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                let mut addr = loopback_addr(1);
                addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::new(10, 255, 255, 1)).to_be();

                let start = Instant::now();
                let rt = connect_with_timeout(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                    200,
                );
                let e = errno();
                let elapsed = start.elapsed();
                close(fd);

                if rt == -1 && e == libc::ETIMEDOUT {
                    assert!(elapsed >= Duration::from_millis(150));
                    assert!(elapsed <= Duration::from_millis(2000));
                } else {
                    // Sandboxes without a routable black hole fail the
                    // connect outright; nothing to measure then.
                    finfo!("blackhole connect returned {} errno {}, skipping", rt, e);
                }
                finished.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| finished.load(Ordering::SeqCst), "blackhole connect");
        iom.stop();
    }

    #[test]
    fn test_connect_timeout_setting_is_observed() {
        ensure_init();
        let var = settings::int_var("tcp.connect.timeout", 5000, "");
        let before = var.get();

        var.set(777);
        assert_eq!(connect_timeout_ms(), 777);
        var.set(-1);
        assert_eq!(connect_timeout_ms(), TIMEOUT_NONE);

        var.set(before);
    }

    #[test]
    fn test_disabled_thread_falls_through() {
        // Hooks are off on this plain test thread: read on a bad fd hits the
        // kernel and reports EBADF itself.
        assert!(!is_enabled());
        let mut buf = [0u8; 4];
        let n = read(-1, buf.as_mut_ptr() as *mut c_void, buf.len());
        assert_eq!(n, -1);
        assert_eq!(errno(), libc::EBADF);
    }
}
