//! Runtime configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use cport_runtime::config::{BackendKind, RuntimeConfig};
//!
//! // Defaults with env overrides
//! let config = RuntimeConfig::from_env();
//!
//! // Or customize programmatically
//! let config = RuntimeConfig::new()
//!     .num_workers(2)
//!     .backend(BackendKind::Threaded);
//! ```

pub mod defaults;

use cport_core::env::{env_get, env_get_ms};
use cport_core::task::{AwaitRejectPolicy, EngineConfig};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Which completion backend the IO handler sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// io_uring if the kernel lets us set up a ring, threaded otherwise
    #[default]
    Auto,
    Uring,
    Threaded,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "uring" | "io_uring" | "iouring" => Ok(BackendKind::Uring),
            "threaded" | "threads" => Ok(BackendKind::Threaded),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Auto => "auto",
            BackendKind::Uring => "uring",
            BackendKind::Threaded => "threaded",
        })
    }
}

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads looping on the completion port
    pub num_workers: usize,
    pub backend: BackendKind,
    /// io_uring submission queue size
    pub ring_entries: u32,
    /// Threaded backend job queue size
    pub queue_capacity: usize,
    /// Threaded backend I/O threads
    pub io_threads: usize,
    /// Longest a parked thread sleeps before re-checking its queue
    pub park_timeout: Duration,
    /// Spins in `resume_io` before yielding
    pub resume_spin_limit: u32,
    pub await_reject: AwaitRejectPolicy,
    /// Receive buffer size of a line connection
    pub recv_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_backend() -> BackendKind {
    defaults::BACKEND.parse().unwrap_or_default()
}

fn default_await_reject() -> AwaitRejectPolicy {
    defaults::AWAIT_REJECT.parse().unwrap_or_default()
}

impl RuntimeConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CPORT_NUM_WORKERS` - Worker threads (0 = logical CPUs)
    /// - `CPORT_BACKEND` - `auto`, `uring` or `threaded`
    /// - `CPORT_RING_ENTRIES` - io_uring entries
    /// - `CPORT_QUEUE_CAPACITY` - Threaded backend job queue size
    /// - `CPORT_IO_THREADS` - Threaded backend I/O threads
    /// - `CPORT_PARK_TIMEOUT_MS` - Park timeout in milliseconds
    /// - `CPORT_RESUME_SPINS` - Spins before yielding in an I/O resume
    /// - `CPORT_AWAIT_REJECT` - `park` or `kill`
    /// - `CPORT_RECV_BUFFER` - Line connection receive buffer
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            num_workers: match env_get("CPORT_NUM_WORKERS", defaults::NUM_WORKERS) {
                0 => logical_cpus(),
                n => n,
            },
            backend: env_get("CPORT_BACKEND", base.backend),
            ring_entries: env_get("CPORT_RING_ENTRIES", base.ring_entries),
            queue_capacity: env_get("CPORT_QUEUE_CAPACITY", base.queue_capacity),
            io_threads: env_get("CPORT_IO_THREADS", base.io_threads),
            park_timeout: env_get_ms("CPORT_PARK_TIMEOUT_MS", base.park_timeout),
            resume_spin_limit: env_get("CPORT_RESUME_SPINS", base.resume_spin_limit),
            await_reject: env_get("CPORT_AWAIT_REJECT", base.await_reject),
            recv_buffer: env_get("CPORT_RECV_BUFFER", base.recv_buffer),
        }
    }

    /// Create config with library defaults (no env override).
    pub fn new() -> Self {
        Self {
            num_workers: match defaults::NUM_WORKERS {
                0 => logical_cpus(),
                n => n,
            },
            backend: default_backend(),
            ring_entries: defaults::RING_ENTRIES,
            queue_capacity: defaults::QUEUE_CAPACITY,
            io_threads: defaults::IO_THREADS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            resume_spin_limit: defaults::RESUME_SPIN_LIMIT,
            await_reject: default_await_reject(),
            recv_buffer: defaults::RECV_BUFFER,
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = kind;
        self
    }

    pub fn ring_entries(mut self, n: u32) -> Self {
        self.ring_entries = n;
        self
    }

    pub fn queue_capacity(mut self, cap: usize) -> Self {
        self.queue_capacity = cap;
        self
    }

    pub fn io_threads(mut self, n: usize) -> Self {
        self.io_threads = n;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn resume_spin_limit(mut self, spins: u32) -> Self {
        self.resume_spin_limit = spins;
        self
    }

    pub fn await_reject(mut self, policy: AwaitRejectPolicy) -> Self {
        self.await_reject = policy;
        self
    }

    pub fn recv_buffer(mut self, size: usize) -> Self {
        self.recv_buffer = size;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > defaults::MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.ring_entries == 0 || !self.ring_entries.is_power_of_two() {
            return Err(ConfigError::InvalidValue("ring_entries must be a power of two"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("queue_capacity must be > 0"));
        }
        if self.io_threads == 0 {
            return Err(ConfigError::InvalidValue("io_threads must be > 0"));
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("park_timeout must be > 0"));
        }
        if self.recv_buffer < 16 {
            return Err(ConfigError::InvalidValue("recv_buffer must be >= 16"));
        }
        Ok(())
    }

    /// The task engine's share of the configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            resume_spin_limit: self.resume_spin_limit,
            await_reject: self.await_reject,
        }
    }

    /// Log the configuration at debug level.
    pub fn log(&self) {
        tracing::debug!(
            num_workers = self.num_workers,
            backend = %self.backend,
            ring_entries = self.ring_entries,
            queue_capacity = self.queue_capacity,
            io_threads = self.io_threads,
            park_timeout = ?self.park_timeout,
            resume_spin_limit = self.resume_spin_limit,
            await_reject = ?self.await_reject,
            recv_buffer = self.recv_buffer,
            "runtime configuration"
        );
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),

    #[error("unknown backend '{0}' (expected auto, uring or threaded)")]
    UnknownBackend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env() {
        let config = RuntimeConfig::from_env();
        assert!(config.num_workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .num_workers(8)
            .backend(BackendKind::Threaded)
            .await_reject(AwaitRejectPolicy::Park)
            .park_timeout(Duration::from_millis(5));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.backend, BackendKind::Threaded);
        assert_eq!(config.park_timeout, Duration::from_millis(5));

        let engine = config.engine_config();
        assert_eq!(engine.await_reject, AwaitRejectPolicy::Park);
        assert_eq!(engine.resume_spin_limit, defaults::RESUME_SPIN_LIMIT);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().num_workers(0).validate().is_err());
        assert!(RuntimeConfig::new().num_workers(1000).validate().is_err());
        assert!(RuntimeConfig::new().ring_entries(100).validate().is_err());
        assert!(RuntimeConfig::new().io_threads(0).validate().is_err());
        assert!(RuntimeConfig::new().recv_buffer(4).validate().is_err());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("URING".parse::<BackendKind>(), Ok(BackendKind::Uring));
        assert_eq!("threaded".parse::<BackendKind>(), Ok(BackendKind::Threaded));
        assert_eq!("auto".parse::<BackendKind>(), Ok(BackendKind::Auto));
        assert!(matches!(
            "epoll".parse::<BackendKind>(),
            Err(ConfigError::UnknownBackend(_))
        ));
    }
}
