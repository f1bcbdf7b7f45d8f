//! Completion backend abstraction
//!
//! A `CompletionBackend` is the OS queue under an IO handler: it accepts
//! operation tokens (real I/O or synthetic posts) and hands them back, one
//! per `wait`, to whichever worker thread is blocked there.
//!
//! # Implementors (in `cport-runtime`)
//!
//! - `UringBackend`: io_uring. Tokens ride in `user_data`, posts are NOPs.
//! - `ThreadedBackend`: a bounded completion queue plus a small blocking
//!   I/O pool. Works where io_uring is unavailable or forbidden.

use crate::error::PortResult;
use crate::op::NativeIo;

use std::os::fd::RawFd;

/// Token value that carries no operation. A worker that receives it was
/// woken spuriously and waits again.
pub const NULL_TOKEN: u64 = 0;

/// One completion as the backend sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCompletion {
    /// Token passed to `post` or `submit`.
    pub token: u64,
    /// Bytes transferred, or negative errno.
    pub result: i32,
}

impl RawCompletion {
    #[inline]
    pub fn ok(&self) -> bool {
        self.result >= 0
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        if self.result > 0 {
            self.result as usize
        } else {
            0
        }
    }

    #[inline]
    pub fn errno(&self) -> Option<i32> {
        (self.result < 0).then(|| -self.result)
    }
}

/// Queue of completions shared by every worker.
///
/// **Contract:** `post` and `submit` never block. A submit that returns an
/// error did not queue anything; the caller still owns the token.
pub trait CompletionBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Associate a descriptor with the queue.
    fn register(&self, fd: RawFd) -> PortResult<()>;

    /// Queue a synthetic completion with result 0.
    fn post(&self, token: u64) -> PortResult<()>;

    /// Start an I/O request; its completion carries `token`.
    fn submit(&self, token: u64, io: NativeIo) -> PortResult<()>;

    /// Block until a completion is available or the backend is closed.
    ///
    /// May return [`NULL_TOKEN`] completions; callers retry on those.
    fn wait(&self) -> PortResult<RawCompletion>;

    /// Wake every waiter with `Closed`, now and for all later waits.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Hand over completions that are already queued, without blocking.
    /// Used at teardown to reclaim operations nobody will wait for.
    fn drain(&self, sink: &mut dyn FnMut(RawCompletion));
}
