//! Library defaults for [`RuntimeConfig`](super::RuntimeConfig)

/// Worker threads blocked on the completion port. `0` means one per
/// logical CPU.
pub const NUM_WORKERS: usize = 0;

/// Backend selection: `auto`, `uring` or `threaded`
pub const BACKEND: &str = "auto";

/// io_uring submission queue entries (power of two)
pub const RING_ENTRIES: u32 = 256;

/// Pending I/O jobs the threaded backend accepts before `QueueFull`
pub const QUEUE_CAPACITY: usize = 4096;

/// Blocking I/O threads of the threaded backend
pub const IO_THREADS: usize = 4;

pub const PARK_TIMEOUT_MS: u64 = 10;

pub const RESUME_SPIN_LIMIT: u32 = 1024;

/// `park` or `kill`
pub const AWAIT_REJECT: &str = "kill";

/// Receive buffer of a line connection
pub const RECV_BUFFER: usize = 1024;

pub const MAX_WORKERS: usize = 256;
