//! # strand — cooperative fibers under blocking POSIX I/O
//!
//! Strand runs synchronous-looking code on stackful fibers and turns the
//! blocking syscalls that code makes — `read`, `connect`, `sleep`, ... —
//! into non-blocking kernel calls plus fiber suspension on an epoll event
//! loop. Return values and errno stay POSIX-faithful, so code written
//! against the blocking model keeps working unmodified.
//!
//! ## Quick start
//!
//! ```ignore
//! use strand::{IoManager, RuntimeConfig};
//! use strand::net::{TcpListener, TcpStream};
//!
//! fn main() {
//!     let iom = IoManager::new(RuntimeConfig::new().workers(4)).unwrap();
//!     iom.spawn(|| {
//!         let listener = TcpListener::bind("0.0.0.0:9000".parse().unwrap()).unwrap();
//!         loop {
//!             let (stream, _) = listener.accept().unwrap();
//!             IoManager::current().unwrap().spawn(move || {
//!                 let mut buf = [0u8; 4096];
//!                 while let Ok(n) = stream.read(&mut buf) {
//!                     if n == 0 || stream.write_all(&buf[..n]).is_err() {
//!                         break;
//!                     }
//!                 }
//!             }).ok();
//!         }
//!     }).unwrap();
//!     // ... iom.stop() on shutdown
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     fiber code                           │
//! │        net::TcpStream / hook::read / hook::sleep         │
//! └──────────────────────────────────────────────────────────┘
//!                             │ would-block
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  hook layer: FdCtx lookup, EINTR retry, timeout timers,  │
//! │  add_event + park, POSIX (result, errno) on resume       │
//! └──────────────────────────────────────────────────────────┘
//!              │                               │
//!              ▼                               ▼
//! ┌───────────────────────┐      ┌───────────────────────────┐
//! │ IoManager (epoll +    │      │ Scheduler (workers, ready │
//! │ timers + fd events)   │◄────►│ queue, context switching) │
//! └───────────────────────┘      └───────────────────────────┘
//! ```

pub use strand_core::{
    env_get, env_get_bool, env_get_opt, env_get_str, env_is_set, settings, FiberId, FiberState,
    LogLevel, RuntimeError, RuntimeResult,
};
pub use strand_core::{fdebug, ferror, finfo, fprintln, ftrace, fwarn};
pub use strand_core::fprint::{init as init_logging, set_flush_enabled, set_log_level};

pub use strand_runtime::{
    block_current, yield_now, Fiber, RuntimeConfig, Scheduler, TimerId,
};

pub use strand_io::{hook, net, Event, FdCtx, FdMgr, IoError, IoManager, IoResult, TimeoutKind};

/// Sleep the current fiber (hooked `usleep`); falls back to a thread sleep
/// outside fiber context.
pub fn sleep_ms(ms: u64) {
    if strand_runtime::tls::is_in_fiber() {
        let _ = hook::usleep((ms * 1000).min(u32::MAX as u64) as u32);
    } else {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

/// Spawn a fiber on the current thread's IoManager.
///
/// Convenience for fiber code that spawns more fibers (e.g. one per accepted
/// connection); returns None outside manager threads.
pub fn spawn<F>(f: F) -> Option<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    IoManager::current().and_then(|iom| iom.spawn(f).ok())
}
