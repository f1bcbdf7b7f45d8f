//! # cport-core
//!
//! Core types for the cport completion-port runtime.
//!
//! This crate holds no OS queue code. The io_uring and threaded backends,
//! the IO handler and the worker pool live in `cport-runtime`.
//!
//! ## Modules
//!
//! - `shared` - atomic reference-counted objects with generation tags
//! - `task` - suspendable state machines and their driver
//! - `op` - completion operations and token validation
//! - `source` - shared file/socket descriptors
//! - `backend` - completion backend trait
//! - `error` - error types and the fatal-abort path
//! - `env` - environment variable helpers

pub mod backend;
pub mod env;
pub mod error;
pub mod op;
pub mod shared;
pub mod source;
pub mod task;

// Re-exports for convenience
pub use backend::{CompletionBackend, RawCompletion, NULL_TOKEN};
pub use error::{
    fatal, PortError, PortResult, SharedError, SharedResult, TaskError, TaskResult, WaitError,
};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt};
pub use op::{IoRequest, NativeIo, OpKind, OpPayload, Operation, OP_MAGIC};
pub use shared::{Destructor, Retainer};
pub use source::Source;
pub use task::{
    AwaitRejectPolicy, Engine, EngineConfig, EngineStats, IoResult, KillOutcome, Machine, Step,
    StepCx, TaskEnd, TaskHandle, TaskId, TaskState,
};
