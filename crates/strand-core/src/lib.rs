//! # strand-core
//!
//! Foundation types shared by every strand crate: fiber identifiers and
//! states, error types, the `fprint` logging macros, environment helpers and
//! the live settings registry.
//!
//! This crate deliberately has no dependencies; everything platform-specific
//! lives in `strand-runtime` and `strand-io`.

pub mod env;
pub mod error;
pub mod fprint;
pub mod id;
pub mod settings;
pub mod state;

pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};
pub use error::{RuntimeError, RuntimeResult};
pub use fprint::LogLevel;
pub use id::FiberId;
pub use settings::IntVar;
pub use state::FiberState;
