//! Completion operations
//!
//! Every request handed to the OS carries a boxed [`Operation`] whose
//! address is the completion token (`user_data` for io_uring). When the
//! token comes back, [`Operation::from_token`] checks the magic before
//! trusting it.
//!
//! The payload is a closed enum; its variant is the operation's type tag.
//! Read and write payloads own the buffer and a retained [`Source`] for as
//! long as the kernel may touch them.

use crate::error::{PortError, PortResult};
use crate::shared::Retainer;
use crate::source::Source;
use crate::task::TaskHandle;

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// "CPORTASY"
pub const OP_MAGIC: u64 = 0x4350_4f52_5441_5359;

/// Operation type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    /// A client connected; the payload carries its socket
    StartClient = 0,
    Read = 1,
    Write = 2,
    /// Synthetic completion resuming a task suspended on I/O
    Notify = 3,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::StartClient => "start-client",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Notify => "notify",
        };
        f.write_str(s)
    }
}

/// Buffer I/O on a source, on behalf of a task.
pub struct IoRequest {
    pub task: TaskHandle,
    pub source: Retainer<Source>,
    /// Reads fill `buf[at..]`; writes send `buf[at..]`.
    pub buf: Vec<u8>,
    pub at: usize,
}

impl IoRequest {
    pub fn fd(&self) -> Option<RawFd> {
        self.source.get().map(Source::fd)
    }

    fn window(&self) -> usize {
        self.buf.len().saturating_sub(self.at)
    }
}

pub enum OpPayload {
    StartClient { fd: OwnedFd },
    Read(IoRequest),
    Write(IoRequest),
    Notify { task: TaskHandle },
}

/// What the kernel (or the emulation) is asked to do for an operation.
///
/// Pointers stay valid while the owning `Operation` is alive and not moved
/// out of its box.
#[derive(Debug, Clone, Copy)]
pub enum NativeIo {
    Recv { fd: RawFd, ptr: *mut u8, len: u32 },
    Send { fd: RawFd, ptr: *const u8, len: u32 },
}

// Safety: the pointers target a buffer owned by a boxed Operation, which
// stays put until its completion is reaped.
unsafe impl Send for NativeIo {}

impl NativeIo {
    #[inline]
    pub fn fd(&self) -> RawFd {
        match *self {
            NativeIo::Recv { fd, .. } | NativeIo::Send { fd, .. } => fd,
        }
    }
}

/// Heap record behind a completion token
#[repr(C)]
pub struct Operation {
    /// Must stay the first field: token validation reads it blind.
    magic: u64,
    payload: OpPayload,
}

impl Operation {
    /// Allocate an operation with the magic stamped.
    pub fn new(payload: OpPayload) -> Box<Self> {
        Box::new(Self { magic: OP_MAGIC, payload })
    }

    pub fn start_client(fd: OwnedFd) -> Box<Self> {
        Self::new(OpPayload::StartClient { fd })
    }

    pub fn read(req: IoRequest) -> Box<Self> {
        Self::new(OpPayload::Read(req))
    }

    pub fn write(req: IoRequest) -> Box<Self> {
        Self::new(OpPayload::Write(req))
    }

    pub fn notify(task: TaskHandle) -> Box<Self> {
        Self::new(OpPayload::Notify { task })
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        match self.payload {
            OpPayload::StartClient { .. } => OpKind::StartClient,
            OpPayload::Read(_) => OpKind::Read,
            OpPayload::Write(_) => OpKind::Write,
            OpPayload::Notify { .. } => OpKind::Notify,
        }
    }

    #[inline]
    pub fn payload(&self) -> &OpPayload {
        &self.payload
    }

    /// Take the payload out, consuming the operation.
    pub fn into_payload(self: Box<Self>) -> OpPayload {
        let Operation { payload, .. } = *self;
        payload
    }

    /// The kernel-facing description of a read or write.
    ///
    /// `None` for synthetic operations, or when the source was released.
    pub fn native(&mut self) -> Option<NativeIo> {
        match &mut self.payload {
            OpPayload::Read(req) => {
                let fd = req.fd()?;
                let len = u32::try_from(req.window()).unwrap_or(u32::MAX);
                let at = req.at.min(req.buf.len());
                let ptr = req.buf[at..].as_mut_ptr();
                Some(NativeIo::Recv { fd, ptr, len })
            }
            OpPayload::Write(req) => {
                let fd = req.fd()?;
                let len = u32::try_from(req.window()).unwrap_or(u32::MAX);
                let at = req.at.min(req.buf.len());
                let ptr = req.buf[at..].as_ptr();
                Some(NativeIo::Send { fd, ptr, len })
            }
            OpPayload::StartClient { .. } | OpPayload::Notify { .. } => None,
        }
    }

    /// Hand the operation to the OS. Ownership travels in the token.
    #[inline]
    pub fn into_token(self: Box<Self>) -> u64 {
        Box::into_raw(self) as usize as u64
    }

    /// Reclaim an operation from a completion token.
    ///
    /// Returns `ForeignToken` when the token is null or its magic does not
    /// match. The caller decides whether that is fatal.
    ///
    /// # Safety
    /// A non-null `token` must point to readable memory at least 8 bytes
    /// long; if the magic matches, it must come from [`Operation::into_token`]
    /// and not have been reclaimed before.
    pub unsafe fn from_token(token: u64) -> PortResult<Box<Self>> {
        let raw = token as usize as *mut Operation;
        if raw.is_null() {
            return Err(PortError::ForeignToken(token));
        }
        let magic = std::ptr::read(raw as *const u64);
        if magic != OP_MAGIC {
            return Err(PortError::ForeignToken(token));
        }
        Ok(Box::from_raw(raw))
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Operation");
        d.field("kind", &self.kind());
        match &self.payload {
            OpPayload::StartClient { fd } => d.field("fd", &fd.as_raw_fd()),
            OpPayload::Read(req) | OpPayload::Write(req) => d
                .field("task", &req.task.id())
                .field("fd", &req.fd())
                .field("at", &req.at)
                .field("len", &req.buf.len()),
            OpPayload::Notify { task } => d.field("task", &task.id()),
        };
        d.finish()
    }
}
