//! # strand-runtime
//!
//! The fiber engine: stackful coroutines with hand-written context switching,
//! mmap'd guard-paged stacks, a shared timer queue, and a cooperative
//! scheduler over a worker thread pool.
//!
//! The scheduler is event-loop agnostic: it parks idle workers through the
//! [`Idler`] seam. strand-io plugs an epoll-backed idler in to get an I/O
//! event loop; on its own the runtime uses condvar parking.
//!
//! ```ignore
//! let sched = Scheduler::new(RuntimeConfig::new().workers(4))?;
//! sched.start()?;
//! sched.spawn(|| {
//!     // fiber code; yield_now() / block_current() suspend cooperatively
//! })?;
//! ```

pub mod arch;
pub mod config;
pub mod fiber;
pub mod park;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

pub use config::{RuntimeConfig, DEFAULT_STACK_SIZE};
pub use fiber::{block_current, yield_now, Fiber};
pub use park::ParkIdler;
pub use scheduler::{Idler, Scheduler, ThreadInit};
pub use timer::{TimerCallback, TimerCondition, TimerId, TimerQueue};
