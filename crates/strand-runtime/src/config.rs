//! Scheduler configuration

use strand_core::{env_get, RuntimeError, RuntimeResult};
use std::time::Duration;

/// Default usable stack per fiber.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Configuration for a scheduler / IoManager.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name prefix for worker threads.
    pub name: String,

    /// Number of worker threads (defaults to CPU count, `STRAND_WORKERS`
    /// overrides).
    pub workers: usize,

    /// Usable stack bytes per fiber.
    pub stack_size: usize,

    /// Longest a worker blocks while idle; bounds shutdown and timer latency
    /// when nothing else wakes it.
    pub idle_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            name: "strand".to_string(),
            workers: env_get("STRAND_WORKERS", cpus),
            stack_size: env_get("STRAND_STACK_SIZE", DEFAULT_STACK_SIZE),
            idle_timeout: Duration::from_millis(3000),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread name prefix.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of worker threads.
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    /// Set the usable stack size per fiber.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set the maximum idle block.
    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.workers == 0 {
            return Err(RuntimeError::InvalidConfig("workers must be at least 1"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(RuntimeError::InvalidConfig("stack_size below 16 KiB"));
        }
        if self.idle_timeout.is_zero() {
            return Err(RuntimeError::InvalidConfig("idle_timeout must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let cfg = RuntimeConfig::new()
            .name("io")
            .workers(2)
            .stack_size(128 * 1024)
            .idle_timeout(Duration::from_millis(500));
        assert_eq!(cfg.name, "io");
        assert_eq!(cfg.workers, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(RuntimeConfig::new().workers(0).validate().is_err());
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new()
            .idle_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
