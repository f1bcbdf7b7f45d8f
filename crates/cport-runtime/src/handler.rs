//! The IO handler: one completion port shared by every worker and
//! connection
//!
//! Operations go in through [`IoHandler::post`] (synthetic) or
//! [`IoHandler::submit`] (real reads and writes) and come back out of
//! [`IoHandler::wait_next`] on whichever worker is waiting.
//!
//! Ownership of an operation travels with its token: `post`/`submit` turn
//! the box into a token, `wait_next` (or the drain at teardown) turns the
//! token back into the box. If queueing fails the box is handed back to
//! the caller untouched.

use crate::backend;
use crate::config::RuntimeConfig;
use cport_core::backend::{CompletionBackend, NULL_TOKEN};
use cport_core::error::{fatal, PortError, PortResult, SharedError, WaitError};
use cport_core::op::{OpPayload, Operation};
use cport_core::shared::Retainer;
use cport_core::source::Source;

use std::fmt;

/// A finished operation, as handed to a worker
#[derive(Debug)]
pub struct Completion {
    pub op: Box<Operation>,
    pub ok: bool,
    pub bytes: usize,
    pub os_error: Option<i32>,
}

/// Failed `post` or `submit`; the operation was not queued.
#[derive(Debug)]
pub struct Rejected {
    pub error: PortError,
    pub op: Box<Operation>,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation rejected: {}", self.op.kind(), self.error)
    }
}

pub struct IoHandler {
    backend: Box<dyn CompletionBackend>,
}

fn log_release(handler: &mut IoHandler) {
    tracing::debug!(backend = handler.backend.name(), "io handler released");
}

impl IoHandler {
    /// Create the handler on the backend `config` selects.
    pub fn create(config: &RuntimeConfig) -> PortResult<Retainer<IoHandler>> {
        Self::with_backend(backend::open(config)?)
    }

    pub fn with_backend(backend: Box<dyn CompletionBackend>) -> PortResult<Retainer<IoHandler>> {
        tracing::info!(backend = backend.name(), "io handler created");
        Ok(Retainer::make(IoHandler { backend }, Some(log_release))?)
    }

    #[inline]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    #[cfg(test)]
    pub(crate) fn backend(&self) -> &dyn CompletionBackend {
        &*self.backend
    }

    /// Associate a source with the port. Once per source, before any I/O.
    pub fn register(&self, source: &Retainer<Source>) -> PortResult<()> {
        let src = source.get().ok_or(PortError::Shared(SharedError::Released))?;
        self.backend.register(src.fd())?;
        src.mark_registered()?;
        tracing::trace!(fd = src.fd(), "source registered");
        Ok(())
    }

    /// Queue a synthetic completion carrying `op`.
    pub fn post(&self, op: Box<Operation>) -> Result<(), Rejected> {
        let token = op.into_token();
        self.backend.post(token).map_err(|error| Rejected {
            error,
            // Safety: the token was produced just above and not queued.
            op: unsafe { reclaim(token) },
        })
    }

    /// Start the read or write described by `op`.
    ///
    /// The source must be registered. On success `op` (with its buffer,
    /// source and task) belongs to the port until its completion is reaped.
    pub fn submit(&self, mut op: Box<Operation>) -> Result<(), Rejected> {
        if let Err(error) = self.check_submit(&op) {
            return Err(Rejected { error, op });
        }
        let Some(io) = op.native() else {
            return Err(Rejected { error: PortError::Shared(SharedError::Released), op });
        };
        let token = op.into_token();
        self.backend.submit(token, io).map_err(|error| Rejected {
            error,
            // Safety: the backend refused the token, nothing else holds it.
            op: unsafe { reclaim(token) },
        })
    }

    fn check_submit(&self, op: &Operation) -> PortResult<()> {
        if self.backend.is_closed() {
            return Err(PortError::Closed);
        }
        let req = match op.payload() {
            OpPayload::Read(req) | OpPayload::Write(req) => req,
            _ => return Err(PortError::NotIo(op.kind())),
        };
        let src = req.source.get().ok_or(PortError::Shared(SharedError::Released))?;
        if !src.is_registered() {
            return Err(PortError::NotRegistered(src.fd()));
        }
        Ok(())
    }

    /// Block until an operation completes.
    ///
    /// Null tokens are spurious wakes and are waited through. A closed port
    /// yields [`WaitError::Closed`]. A token that is not one of ours means
    /// the queue is corrupt: the process aborts.
    pub fn wait_next(&self) -> Result<Completion, WaitError> {
        loop {
            let raw = match self.backend.wait() {
                Ok(raw) => raw,
                Err(PortError::Closed) => return Err(WaitError::Closed),
                Err(PortError::Os(errno)) => return Err(WaitError::Os(errno)),
                Err(e) => {
                    tracing::error!(error = %e, "completion wait failed");
                    return Err(WaitError::Os(libc::EIO));
                }
            };
            if raw.token == NULL_TOKEN {
                tracing::trace!("spurious wake");
                continue;
            }
            // Safety: only `post` and `submit` put non-null tokens on the
            // queue, and each is reaped once.
            let op = match unsafe { Operation::from_token(raw.token) } {
                Ok(op) => op,
                Err(e) => fatal("completion token", &e),
            };
            return Ok(Completion {
                op,
                ok: raw.ok(),
                bytes: raw.bytes(),
                os_error: raw.errno(),
            });
        }
    }

    /// Close the port. Blocked and future waits return `Closed`.
    pub fn close(&self) {
        if !self.backend.is_closed() {
            tracing::info!(backend = self.backend.name(), "closing io handler");
        }
        self.backend.close();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }

    /// Reclaim every operation still queued, dropping the tasks, buffers
    /// and sources they own. Returns how many were reclaimed.
    ///
    /// Meant for shutdown after the workers are gone: suspended tasks hold
    /// retainers of this handler, and draining is what lets them go.
    pub fn drain(&self) -> usize {
        let mut reclaimed = 0usize;
        self.backend.drain(&mut |raw| {
            if raw.token == NULL_TOKEN {
                return;
            }
            // Safety: as in `wait_next`; nobody will wait for these anymore.
            match unsafe { Operation::from_token(raw.token) } {
                Ok(op) => {
                    reclaimed += 1;
                    drop(op);
                }
                Err(e) => tracing::error!(error = %e, "foreign token in queue at teardown"),
            }
        });
        if reclaimed > 0 {
            tracing::debug!(reclaimed, "reclaimed queued operations");
        }
        reclaimed
    }
}

/// # Safety
/// `token` must come from `Operation::into_token` and not be reclaimed yet.
unsafe fn reclaim(token: u64) -> Box<Operation> {
    match Operation::from_token(token) {
        Ok(op) => op,
        Err(e) => fatal("reclaim token", &e),
    }
}

impl Drop for IoHandler {
    fn drop(&mut self) {
        self.close();
        self.drain();
    }
}

/// Wait on a shared handler. A released retainer is `NullHandler`.
pub fn wait_next(handler: &Retainer<IoHandler>) -> Result<Completion, WaitError> {
    handler.get().ok_or(WaitError::NullHandler)?.wait_next()
}
