//! # cport-runtime
//!
//! Linux runtime for the cport completion port.
//!
//! This crate provides:
//! - Completion backends (io_uring, and a threaded fallback on a blocking
//!   I/O pool)
//! - The IO handler shared by every worker
//! - Worker threads that dispatch completions to tasks
//! - Helpers for issuing reads and writes from a task step
//! - A line-oriented connection task used by `cport-lines`

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod config;
        pub mod parking;
        pub mod backend;
        pub mod handler;
        pub mod io;
        pub mod worker;
        pub mod lines;

        // Re-exports
        pub use config::{BackendKind, ConfigError, RuntimeConfig};
        pub use handler::{wait_next, Completion, IoHandler, Rejected};
        pub use io::IssueFailed;
        pub use worker::{ClientFactory, WorkerPool, WorkerStats};
        pub use lines::{line_factory, LineConn, LineParams, LineParser};
    } else {
        compile_error!("cport-runtime needs io_uring or futex: Linux only");
    }
}
