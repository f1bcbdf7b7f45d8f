//! Worker pool
//!
//! Workers are OS threads blocked in [`wait_next`]. Each completion is
//! dispatched on its operation type alone:
//!
//! - `StartClient`: wrap the descriptor in a [`Source`], register it and
//!   start a connection task built by the pool's [`ClientFactory`]
//! - `Read` / `Write`: hand the result and buffer to the issuing task and
//!   resume it
//! - `Notify`: resume the task with an empty result
//!
//! A closed port ends the loop.

use crate::handler::{wait_next, Completion, IoHandler};
use cport_core::error::{PortError, PortResult, TaskError, TaskResult, WaitError};
use cport_core::op::{IoRequest, OpPayload};
use cport_core::shared::Retainer;
use cport_core::source::Source;
use cport_core::task::{Engine, IoResult, TaskHandle};

use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Builds the task that serves a freshly connected client.
///
/// Called on a worker thread with the port and the client's registered
/// source. The returned task is started right away.
pub type ClientFactory = Arc<
    dyn Fn(&Engine, &Retainer<IoHandler>, Retainer<Source>) -> TaskResult<TaskHandle>
        + Send
        + Sync,
>;

/// What one worker did before it exited
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub completions: u64,
    pub clients: u64,
    pub resumed: u64,
    /// Resumes the engine refused (task destroyed or not suspended)
    pub refused: u64,
    /// Completions that carried an OS error
    pub failed_ops: u64,
}

impl std::ops::AddAssign for WorkerStats {
    fn add_assign(&mut self, o: Self) {
        self.completions += o.completions;
        self.clients += o.clients;
        self.resumed += o.resumed;
        self.refused += o.refused;
        self.failed_ops += o.failed_ops;
    }
}

/// Pool of worker threads
pub struct WorkerPool {
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    /// Start `num_workers` threads on `handler`.
    ///
    /// Each thread gets its own retained copy of the handler before it is
    /// spawned, so the handler outlives every worker whatever the caller
    /// does with its own copy.
    pub fn start(
        num_workers: usize,
        handler: &Retainer<IoHandler>,
        engine: Arc<Engine>,
        factory: ClientFactory,
    ) -> PortResult<Self> {
        Self::start_with(num_workers, handler, |id, handler| {
            let engine = Arc::clone(&engine);
            let factory = Arc::clone(&factory);
            thread::Builder::new()
                .name(format!("cport-worker-{}", id))
                .spawn(move || worker_loop(id, handler, engine, factory))
        })
    }

    /// If any worker fails to start, the handler is closed and the workers
    /// already running are joined before the error is returned.
    fn start_with<F>(
        num_workers: usize,
        handler: &Retainer<IoHandler>,
        mut spawn: F,
    ) -> PortResult<Self>
    where
        F: FnMut(usize, Retainer<IoHandler>) -> io::Result<JoinHandle<WorkerStats>>,
    {
        if handler.is_released() {
            return Err(PortError::InvalidHandler);
        }
        let mut pool = Self { handles: Vec::with_capacity(num_workers) };
        for id in 0..num_workers {
            let spawned = handler
                .retain()
                .map_err(PortError::from)
                .and_then(|retained| spawn(id, retained).map_err(PortError::Setup));
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    tracing::error!(worker = id, error = %e, "worker failed to start, stopping the pool");
                    if let Some(h) = handler.get() {
                        h.close();
                    }
                    pool.join();
                    return Err(e);
                }
            }
        }
        tracing::info!(workers = num_workers, "worker pool started");
        Ok(pool)
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Wait for all workers to exit (after the handler is closed).
    pub fn join(self) -> Vec<WorkerStats> {
        self.handles
            .into_iter()
            .map(|h| h.join().unwrap_or_default())
            .collect()
    }
}

fn worker_loop(
    id: usize,
    mut handler: Retainer<IoHandler>,
    engine: Arc<Engine>,
    factory: ClientFactory,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    tracing::debug!(worker = id, "worker started");

    loop {
        let completion = match wait_next(&handler) {
            Ok(c) => c,
            Err(WaitError::Closed) => break,
            Err(e) => {
                tracing::error!(worker = id, error = %e, "completion wait failed, worker exiting");
                break;
            }
        };
        stats.completions += 1;
        dispatch(&engine, &handler, &factory, completion, &mut stats);
    }

    handler.release();
    tracing::debug!(worker = id, ?stats, "worker exiting");
    stats
}

fn dispatch(
    engine: &Engine,
    handler: &Retainer<IoHandler>,
    factory: &ClientFactory,
    completion: Completion,
    stats: &mut WorkerStats,
) {
    let Completion { op, ok, bytes, os_error } = completion;
    match op.into_payload() {
        OpPayload::StartClient { fd } => {
            if let Err(e) = start_client(engine, handler, factory, fd) {
                tracing::warn!(error = %e, "client not started");
            } else {
                stats.clients += 1;
            }
        }
        OpPayload::Read(req) | OpPayload::Write(req) => {
            let IoRequest { task, source, buf, .. } = req;
            // The operation's hold on the source ends with the operation.
            drop(source);
            let io = if ok {
                IoResult::success(bytes, Some(buf))
            } else {
                stats.failed_ops += 1;
                let errno = os_error.unwrap_or(libc::EIO);
                tracing::debug!(task = %task.id(), errno = %nix::errno::Errno::from_raw(errno), "operation failed");
                IoResult::failure(errno, Some(buf))
            };
            resume(engine, task, io, stats);
        }
        OpPayload::Notify { task } => resume(engine, task, IoResult::success(0, None), stats),
    }
}

fn resume(engine: &Engine, task: TaskHandle, io: IoResult, stats: &mut WorkerStats) {
    match engine.resume_io(task, io) {
        Ok(()) => stats.resumed += 1,
        Err(e) => {
            stats.refused += 1;
            tracing::debug!(error = %e, "completion for a task that cannot resume");
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum StartError {
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Task(#[from] TaskError),
}

fn start_client(
    engine: &Engine,
    handler: &Retainer<IoHandler>,
    factory: &ClientFactory,
    fd: OwnedFd,
) -> Result<(), StartError> {
    let source = Source::open(fd).map_err(PortError::from)?;
    handler.get().ok_or(PortError::InvalidHandler)?.register(&source)?;
    let task = factory(engine, handler, source)?;
    tracing::trace!(task = %task.id(), "client task created");
    engine.start(&task)?;
    Ok(())
}
