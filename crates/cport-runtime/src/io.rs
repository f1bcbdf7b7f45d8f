//! Issuing reads and writes from inside a task step
//!
//! ```ignore
//! fn step(&mut self, cx: &mut StepCx<'_>) -> Step {
//!     match io::read(cx, handler, &self.source, buf, self.filled) {
//!         Ok(()) => Step::YieldIo,
//!         Err(failed) => Step::Finished,
//!     }
//! }
//! ```
//!
//! SUSPENDED_IO is armed before the operation is queued, since another
//! worker can reap the completion before the step returns. A submit that
//! fails disarms it again and hands the buffer back.

use crate::handler::IoHandler;
use cport_core::error::PortError;
use cport_core::op::{IoRequest, OpKind, OpPayload, Operation};
use cport_core::shared::Retainer;
use cport_core::source::Source;
use cport_core::task::StepCx;

use std::fmt;

/// An operation that never reached the port
#[derive(Debug)]
pub struct IssueFailed {
    pub error: PortError,
    pub buf: Vec<u8>,
}

impl fmt::Display for IssueFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I/O not queued: {}", self.error)
    }
}

/// Receive into `buf[at..]`. On `Ok` the step must return `Step::YieldIo`.
pub fn read(
    cx: &mut StepCx<'_>,
    handler: &IoHandler,
    source: &Retainer<Source>,
    buf: Vec<u8>,
    at: usize,
) -> Result<(), IssueFailed> {
    issue(cx, handler, source, buf, at, OpKind::Read)
}

/// Send `buf[at..]`. On `Ok` the step must return `Step::YieldIo`.
pub fn write(
    cx: &mut StepCx<'_>,
    handler: &IoHandler,
    source: &Retainer<Source>,
    buf: Vec<u8>,
    at: usize,
) -> Result<(), IssueFailed> {
    issue(cx, handler, source, buf, at, OpKind::Write)
}

fn issue(
    cx: &mut StepCx<'_>,
    handler: &IoHandler,
    source: &Retainer<Source>,
    buf: Vec<u8>,
    at: usize,
    kind: OpKind,
) -> Result<(), IssueFailed> {
    let build: fn(IoRequest) -> Box<Operation> = match kind {
        OpKind::Read => Operation::read,
        OpKind::Write => Operation::write,
        OpKind::StartClient | OpKind::Notify => {
            return Err(IssueFailed { error: PortError::NotIo(kind), buf });
        }
    };
    // The operation holds its own reference for as long as the OS does.
    let source = match source.retain() {
        Ok(s) => s,
        Err(e) => return Err(IssueFailed { error: e.into(), buf }),
    };
    let op = build(IoRequest { task: cx.task().clone(), source, buf, at });

    cx.prepare_io();
    match handler.submit(op) {
        Ok(()) => Ok(()),
        Err(rejected) => {
            cx.cancel_io();
            tracing::debug!(task = %cx.task().id(), %kind, error = %rejected.error, "I/O not queued");
            let buf = match rejected.op.into_payload() {
                OpPayload::Read(req) | OpPayload::Write(req) => req.buf,
                _ => Vec::new(),
            };
            Err(IssueFailed { error: rejected.error, buf })
        }
    }
}
