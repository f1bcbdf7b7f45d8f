//! Error types for the cport runtime
//!
//! Each concern gets its own enum. Contract violations (refcount underflow,
//! stale generation tags, foreign completion tokens) are not meant to be
//! handled: they go through [`fatal`], which logs and aborts the process.

use thiserror::Error;

/// Result type for shared object operations
pub type SharedResult<T> = Result<T, SharedError>;

/// Result type for task engine operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Result type for completion port operations
pub type PortResult<T> = Result<T, PortError>;

/// Errors from retaining or releasing a shared object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SharedError {
    /// The retainer was already released (or transferred away)
    #[error("retainer already released")]
    Released,

    /// Allocating the shared block failed
    #[error("shared object allocation failed")]
    AllocFailed,

    /// The reference count was already zero
    #[error("shared object is dead (reference count was zero)")]
    Dead,

    /// The generation tag no longer matches the retainer's copy
    #[error("generation tag mismatch: expected {expected:#x}, found {found:#x}")]
    Stale { expected: u64, found: u64 },

    /// Too many outstanding retainers
    #[error("reference count overflow")]
    Overflow,
}

impl SharedError {
    /// Whether this error indicates a broken ownership invariant.
    ///
    /// `Released` and `AllocFailed` are ordinary failures; everything else
    /// means memory was, or was about to be, used after free.
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            SharedError::Dead | SharedError::Stale { .. } | SharedError::Overflow
        )
    }
}

/// Errors from the task engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The machine's constructor refused its parameter
    #[error("task construction failed: {0}")]
    Construct(String),

    /// Another thread is driving the task
    #[error("task is already running")]
    AlreadyRunning,

    /// The task was already started, suspended or destroyed
    #[error("task is not fresh")]
    NotFresh,

    /// The awaited child is not linked back to the awaiting task
    #[error("awaited task is not linked to its caller")]
    NotAwaitingCaller,

    /// The task has already been destroyed
    #[error("task destroyed")]
    Destroyed,

    /// Resume attempted on a task without the matching suspend flag
    #[error("task is not suspended")]
    NotSuspended,
}

/// Errors from the completion port and its backends
#[derive(Debug, Error)]
pub enum PortError {
    /// The handler has been closed
    #[error("completion port closed")]
    Closed,

    /// The handler retainer was released or never created
    #[error("invalid completion port handler")]
    InvalidHandler,

    /// The source was never registered with the handler
    #[error("fd {0} is not registered")]
    NotRegistered(i32),

    /// The source was already registered
    #[error("fd {0} is already registered")]
    AlreadyRegistered(i32),

    /// Synthetic operations are posted, not submitted
    #[error("{0} operations carry no I/O")]
    NotIo(crate::op::OpKind),

    /// Submission or completion queue has no room
    #[error("queue full")]
    QueueFull,

    /// A completion token that was not produced by this runtime
    #[error("foreign completion token {0:#x}")]
    ForeignToken(u64),

    /// Creating the underlying queue failed
    #[error("completion port setup failed: {0}")]
    Setup(#[source] std::io::Error),

    /// OS error with errno
    #[error("OS error: errno {0}")]
    Os(i32),

    /// Shared object failure while preparing an operation
    #[error(transparent)]
    Shared(#[from] SharedError),
}

impl PortError {
    /// Build from an `io::Error`, keeping the errno when there is one.
    pub fn from_io(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => PortError::Os(errno),
            None => PortError::Setup(e),
        }
    }
}

/// Why `wait_next` returned without a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The handler retainer was released
    #[error("null completion port handler")]
    NullHandler,

    /// The handler was closed; workers should leave their loop
    #[error("completion port closed")]
    Closed,

    /// The wait itself failed
    #[error("wait failed: errno {0}")]
    Os(i32),
}

impl WaitError {
    /// Closed is the shutdown signal, not a failure.
    #[inline]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, WaitError::Closed)
    }
}

/// Report a contract violation and abort.
///
/// Continuing after one of these risks undefined behavior, so there is no
/// unwinding: the process stops here.
#[cold]
pub fn fatal(what: &str, detail: &dyn std::fmt::Display) -> ! {
    tracing::error!(violation = what, %detail, "contract violation, aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SharedError::Stale { expected: 0x10, found: 0x11 };
        assert_eq!(e.to_string(), "generation tag mismatch: expected 0x10, found 0x11");

        let e = PortError::NotRegistered(7);
        assert_eq!(e.to_string(), "fd 7 is not registered");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!SharedError::Released.is_fatal());
        assert!(!SharedError::AllocFailed.is_fatal());
        assert!(SharedError::Dead.is_fatal());
        assert!(SharedError::Overflow.is_fatal());
        assert!(SharedError::Stale { expected: 1, found: 0 }.is_fatal());
    }

    #[test]
    fn test_error_conversion() {
        let e: PortError = SharedError::Released.into();
        assert!(matches!(e, PortError::Shared(SharedError::Released)));

        let e = PortError::from_io(std::io::Error::from_raw_os_error(12));
        assert!(matches!(e, PortError::Os(12)));

        assert!(WaitError::Closed.is_shutdown());
        assert!(!WaitError::Os(4).is_shutdown());
    }
}
