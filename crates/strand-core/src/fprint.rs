//! Fiber-runtime logging macros
//!
//! Thread-safe leveled output to stderr, printk-flavored. Log lines carry
//! information only; control flow always travels through return values.
//!
//! # Environment variables
//!
//! - `STRAND_LOG_LEVEL=<level>` - 0/off, 1/error, 2/warn, 3/info, 4/debug, 5/trace
//! - `STRAND_FLUSH_EPRINT=1` - flush stderr after every line (crash debugging)
//!
//! # Usage
//!
//! ```ignore
//! use strand_core::{finfo, fwarn, ferror};
//!
//! finfo!("worker {} started", id);
//! fwarn!("fd {} has no context", fd);
//! ferror!("addEvent({}, {:?}) failed: errno {}", fd, ev, err);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Once;

/// Log levels, lowest is most severe.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    fn parse(s: &str) -> LogLevel {
        match s.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN ]",
            LogLevel::Info => "[INFO ]",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INIT: Once = Once::new();

/// Read `STRAND_LOG_LEVEL` / `STRAND_FLUSH_EPRINT` once.
///
/// Invoked implicitly on first log; call explicitly for deterministic setup.
pub fn init() {
    INIT.call_once(|| {
        if let Ok(v) = std::env::var("STRAND_LOG_LEVEL") {
            LOG_LEVEL.store(LogLevel::parse(&v) as u8, Ordering::Relaxed);
        }
        if let Ok(v) = std::env::var("STRAND_FLUSH_EPRINT") {
            let on = matches!(v.as_str(), "1" | "true" | "yes" | "on");
            FLUSH_ENABLED.store(on, Ordering::Relaxed);
        }
    });
}

/// Current log level.
#[inline]
pub fn log_level() -> LogLevel {
    init();
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Off,
        1 => LogLevel::Error,
        2 => LogLevel::Warn,
        3 => LogLevel::Info,
        4 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

/// Override the log level at runtime.
pub fn set_log_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Override flush-per-line at runtime.
pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether `level` would currently be emitted.
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

#[doc(hidden)]
pub fn _fprintln_impl(args: std::fmt::Arguments<'_>) {
    init();
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _flog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = write!(out, "{} ", level.prefix());
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

/// Print to stderr with newline, line-atomic.
#[macro_export]
macro_rules! fprintln {
    () => {{
        $crate::fprint::_fprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::fprint::_fprintln_impl(format_args!($($arg)*));
    }};
}

/// Error-level log line.
#[macro_export]
macro_rules! ferror {
    ($($arg:tt)*) => {{
        $crate::fprint::_flog_impl($crate::fprint::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning-level log line.
#[macro_export]
macro_rules! fwarn {
    ($($arg:tt)*) => {{
        $crate::fprint::_flog_impl($crate::fprint::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info-level log line.
#[macro_export]
macro_rules! finfo {
    ($($arg:tt)*) => {{
        $crate::fprint::_flog_impl($crate::fprint::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug-level log line.
#[macro_export]
macro_rules! fdebug {
    ($($arg:tt)*) => {{
        $crate::fprint::_flog_impl($crate::fprint::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace-level log line (most verbose).
#[macro_export]
macro_rules! ftrace {
    ($($arg:tt)*) => {{
        $crate::fprint::_flog_impl($crate::fprint::LogLevel::Trace, format_args!($($arg)*));
    }};
}
