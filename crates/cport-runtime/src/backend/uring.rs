//! `UringBackend`: io_uring completion queue.
//!
//! Tokens travel in `user_data`. Reads and writes become `Recv`/`Send`
//! SQEs, posts become `Nop`s. No SQPOLL, no fixed files, no fixed buffers.
//!
//! The submission and completion sides have separate locks so a worker
//! blocked in `io_uring_enter` never holds up another thread's submit.
//! Only one waiter at a time sits in the kernel; the rest queue on the
//! completion lock.

use super::check_fd;
use cport_core::backend::{CompletionBackend, RawCompletion};
use cport_core::error::{PortError, PortResult};
use cport_core::op::NativeIo;

use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// `user_data` of the NOP that wakes the waiter in the kernel on close
const CLOSE_TOKEN: u64 = u64::MAX;

pub struct UringBackend {
    ring: IoUring,
    sq_lock: Mutex<()>,
    cq_lock: Mutex<()>,
    closed: AtomicBool,
    /// SQEs pushed whose CQE has not been reaped
    inflight: AtomicUsize,
}

// Safety: the rings are only touched through `submission_shared` under
// `sq_lock` and `completion_shared` under `cq_lock`; `Submitter` calls are
// thread safe.
unsafe impl Sync for UringBackend {}
unsafe impl Send for UringBackend {}

fn is_transient(errno: Option<i32>) -> bool {
    matches!(errno, Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::ETIME))
}

impl UringBackend {
    pub fn new(entries: u32) -> PortResult<Self> {
        let ring = IoUring::builder().build(entries).map_err(PortError::Setup)?;
        tracing::debug!(entries, "io_uring ready");
        Ok(Self {
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
        })
    }

    /// Push one SQE and enter the kernel.
    fn push(&self, sqe: squeue::Entry) -> PortResult<()> {
        {
            let _guard = self.sq_lock.lock();
            // Safety: `sq_lock` serializes every user of the submission side.
            let mut sq = unsafe { self.ring.submission_shared() };
            if sq.is_full() {
                drop(sq);
                // Flush what is queued and try once more.
                let _ = self.ring.submitter().submit();
                sq = unsafe { self.ring.submission_shared() };
            }
            // Safety: the pointers in `sqe` target a boxed operation that is
            // reclaimed only after its CQE is reaped.
            unsafe { sq.push(&sqe) }.map_err(|_| PortError::QueueFull)?;
            sq.sync();
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);

        // Once pushed, the SQE is queued whatever enter says: the next
        // `submit_and_wait` picks it up.
        if let Err(e) = self.ring.submitter().submit() {
            if !is_transient(e.raw_os_error()) {
                tracing::warn!(error = %e, "io_uring_enter failed after push");
            }
        }
        Ok(())
    }

    /// Pop one CQE, if any. Caller holds `cq_lock`.
    fn pop(&self) -> Option<RawCompletion> {
        // Safety: `cq_lock` serializes every user of the completion side.
        let mut cq = unsafe { self.ring.completion_shared() };
        cq.sync();
        let cqe = cq.next()?;
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        Some(RawCompletion { token: cqe.user_data(), result: cqe.result() })
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }
}

impl CompletionBackend for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn register(&self, fd: RawFd) -> PortResult<()> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        // io_uring needs no per-fd association; make sure the fd is real.
        check_fd(fd)
    }

    fn post(&self, token: u64) -> PortResult<()> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        self.push(opcode::Nop::new().build().user_data(token))
    }

    fn submit(&self, token: u64, io: NativeIo) -> PortResult<()> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        let sqe = match io {
            NativeIo::Recv { fd, ptr, len } => opcode::Recv::new(types::Fd(fd), ptr, len).build(),
            NativeIo::Send { fd, ptr, len } => opcode::Send::new(types::Fd(fd), ptr, len)
                .flags(libc::MSG_NOSIGNAL)
                .build(),
        };
        self.push(sqe.user_data(token))
    }

    fn wait(&self) -> PortResult<RawCompletion> {
        let _guard = self.cq_lock.lock();
        loop {
            if self.is_closed() {
                return Err(PortError::Closed);
            }
            if let Some(c) = self.pop() {
                if c.token == CLOSE_TOKEN {
                    self.closed.store(true, Ordering::Release);
                    return Err(PortError::Closed);
                }
                return Ok(c);
            }
            match self.ring.submitter().submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if is_transient(e.raw_os_error()) => {}
                Err(e) => return Err(PortError::from_io(e)),
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.push(opcode::Nop::new().build().user_data(CLOSE_TOKEN)).is_err() {
            tracing::warn!("io_uring full on close; a waiter may sleep until its next completion");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn drain(&self, sink: &mut dyn FnMut(RawCompletion)) {
        let _guard = self.cq_lock.lock();
        while let Some(c) = self.pop() {
            if c.token != CLOSE_TOKEN {
                sink(c);
            }
        }
        let left = self.inflight();
        if left > 0 {
            // The kernel may still write into their buffers; leaking them is
            // the only safe option.
            tracing::warn!(inflight = left, "operations still in the kernel at teardown, leaking");
        }
    }
}
