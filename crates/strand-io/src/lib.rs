//! # strand-io
//!
//! The I/O half of the strand runtime: an epoll-backed event loop
//! (`IoManager`) plugged into the fiber scheduler, a process-wide descriptor
//! context table (`FdMgr`/`FdCtx`), and the syscall hook layer that converts
//! blocking POSIX calls issued by fiber code into non-blocking calls plus
//! fiber suspension.
//!
//! ```ignore
//! let iom = IoManager::new(RuntimeConfig::new().workers(4))?;
//! iom.spawn(|| {
//!     // Worker threads run with hooks enabled: this "blocking" code
//!     // suspends the fiber instead of the thread.
//!     let listener = net::TcpListener::bind("127.0.0.1:8080".parse().unwrap())?;
//!     loop {
//!         let (stream, _peer) = listener.accept()?;
//!         IoManager::current().unwrap().spawn(move || handle(stream));
//!     }
//! })?;
//! ```

pub mod error;
pub mod event;
pub mod eventfd;
pub mod fd_mgr;
pub mod hook;
pub mod iomanager;
pub mod net;
pub mod poller;

pub use error::{IoError, IoResult};
pub use event::Event;
pub use fd_mgr::{FdCtx, FdMgr, TimeoutKind, TIMEOUT_NONE};
pub use iomanager::IoManager;
