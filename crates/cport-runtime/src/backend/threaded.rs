//! `ThreadedBackend`: completion port emulation on plain threads.
//!
//! Used where io_uring is missing or forbidden. Submitted reads and writes
//! go to a bounded job queue served by a fixed set of I/O threads; each
//! I/O thread polls the descriptors of the jobs it holds and runs the
//! syscall once the descriptor is ready. Results, and synthetic posts, land
//! on an unbounded completion queue that worker threads park on.
//!
//! An eventfd in every I/O thread's poll set lets `submit` and `close`
//! interrupt the poll.

use crate::config::RuntimeConfig;
use crate::parking::{FutexParking, WaiterParking};
use cport_core::backend::{CompletionBackend, RawCompletion};
use cport_core::error::{PortError, PortResult};
use cport_core::op::NativeIo;

use crossbeam_queue::{ArrayQueue, SegQueue};
use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A read or write waiting for its descriptor.
struct Job {
    token: u64,
    io: NativeIo,
}

/// Shared state between submitters, waiters and I/O threads.
struct Shared {
    jobs: ArrayQueue<Job>,
    completions: SegQueue<RawCompletion>,
    waiters: FutexParking,
    kick: OwnedFd,
    closed: AtomicBool,
    /// Held shared while queueing, exclusive while closing: nothing is
    /// queued after `close` returns, so `drain` sees every job.
    gate: RwLock<()>,
    park_timeout: Duration,
    /// Most jobs one I/O thread polls at a time
    per_thread: usize,
}

impl Shared {
    fn complete(&self, c: RawCompletion) {
        self.completions.push(c);
        self.waiters.wake_one();
    }

    fn kick(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.kick.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated: a wake is already pending.
        if ret < 0 && Errno::last() != Errno::EAGAIN {
            tracing::warn!(errno = %Errno::last(), "eventfd write failed");
        }
    }

    fn drain_kick(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.kick.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct ThreadedBackend {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadedBackend {
    pub fn new(config: &RuntimeConfig) -> PortResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(PortError::Setup(std::io::Error::last_os_error()));
        }
        // Safety: `fd` was just created and nothing else owns it.
        let kick = unsafe { OwnedFd::from_raw_fd(fd) };

        let io_threads = config.io_threads.max(1);
        let shared = Arc::new(Shared {
            jobs: ArrayQueue::new(config.queue_capacity.max(1)),
            completions: SegQueue::new(),
            waiters: FutexParking::new(),
            kick,
            closed: AtomicBool::new(false),
            gate: RwLock::new(()),
            park_timeout: config.park_timeout,
            per_thread: config.queue_capacity.div_ceil(io_threads).max(64),
        });

        let backend = Self { shared, threads: Mutex::new(Vec::with_capacity(io_threads)) };
        for id in 0..io_threads {
            let shared = Arc::clone(&backend.shared);
            let handle = thread::Builder::new()
                .name(format!("cport-io-{}", id))
                .spawn(move || io_loop(shared, id))
                .map_err(PortError::Setup)?;
            backend.threads.lock().push(handle);
        }
        tracing::debug!(io_threads, capacity = config.queue_capacity, "threaded backend ready");
        Ok(backend)
    }

    /// Stop the I/O threads and wait for them. Their unfinished jobs are
    /// turned into cancelled completions on the way out.
    fn join_io_threads(&self) {
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }
}

impl CompletionBackend for ThreadedBackend {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn register(&self, fd: RawFd) -> PortResult<()> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        super::check_fd(fd)
    }

    fn post(&self, token: u64) -> PortResult<()> {
        let _open = self.shared.gate.read();
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        self.shared.complete(RawCompletion { token, result: 0 });
        Ok(())
    }

    fn submit(&self, token: u64, io: NativeIo) -> PortResult<()> {
        let _open = self.shared.gate.read();
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        self.shared
            .jobs
            .push(Job { token, io })
            .map_err(|_| PortError::QueueFull)?;
        self.shared.kick();
        Ok(())
    }

    fn wait(&self) -> PortResult<RawCompletion> {
        let shared = &self.shared;
        loop {
            if shared.is_closed() {
                return Err(PortError::Closed);
            }
            let epoch = shared.waiters.prepare();
            if let Some(c) = shared.completions.pop() {
                return Ok(c);
            }
            if shared.is_closed() {
                return Err(PortError::Closed);
            }
            shared.waiters.park(epoch, Some(shared.park_timeout));
        }
    }

    fn close(&self) {
        {
            let _closing = self.shared.gate.write();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        self.shared.waiters.wake_all();
        self.shared.kick();
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn drain(&self, sink: &mut dyn FnMut(RawCompletion)) {
        if self.is_closed() {
            self.join_io_threads();
            while let Some(job) = self.shared.jobs.pop() {
                sink(cancelled(job.token));
            }
        }
        while let Some(c) = self.shared.completions.pop() {
            sink(c);
        }
    }
}

impl Drop for ThreadedBackend {
    fn drop(&mut self) {
        // I/O threads see the flag on their next poll and exit. Not joined
        // here; `drain` does that when teardown needs the completions.
        self.close();
    }
}

fn cancelled(token: u64) -> RawCompletion {
    RawCompletion { token, result: -libc::ECANCELED }
}

fn poll_events(io: &NativeIo) -> libc::c_short {
    match io {
        NativeIo::Recv { .. } => libc::POLLIN,
        NativeIo::Send { .. } => libc::POLLOUT,
    }
}

/// Run the syscall without blocking.
///
/// `None` if the descriptor turned out not to be ready after all.
fn execute(io: &NativeIo) -> Option<i32> {
    let ret = unsafe {
        match *io {
            NativeIo::Recv { fd, ptr, len } => {
                libc::recv(fd, ptr as *mut libc::c_void, len as usize, libc::MSG_DONTWAIT)
            }
            NativeIo::Send { fd, ptr, len } => libc::send(
                fd,
                ptr as *const libc::c_void,
                len as usize,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            ),
        }
    };
    if ret >= 0 {
        return Some(ret.min(i32::MAX as isize) as i32);
    }
    match Errno::last_raw() {
        libc::EAGAIN | libc::EINTR => None,
        errno => Some(-errno),
    }
}

/// I/O thread main loop.
fn io_loop(shared: Arc<Shared>, id: usize) {
    let timeout_ms = shared.park_timeout.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
    let mut pending: Vec<Job> = Vec::new();
    let mut fds: Vec<libc::pollfd> = Vec::new();

    loop {
        if shared.is_closed() {
            for job in pending.drain(..) {
                shared.complete(cancelled(job.token));
            }
            break;
        }

        while pending.len() < shared.per_thread {
            match shared.jobs.pop() {
                Some(job) => pending.push(job),
                None => break,
            }
        }

        fds.clear();
        fds.push(libc::pollfd { fd: shared.kick.as_raw_fd(), events: libc::POLLIN, revents: 0 });
        fds.extend(pending.iter().map(|job| libc::pollfd {
            fd: job.io.fd(),
            events: poll_events(&job.io),
            revents: 0,
        }));

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let errno = Errno::last();
            if errno != Errno::EINTR {
                tracing::warn!(thread = id, %errno, "poll failed");
            }
            continue;
        }
        if fds[0].revents != 0 {
            shared.drain_kick();
        }

        // Back to front so swap_remove only moves jobs already looked at.
        let mut i = pending.len();
        while i > 0 {
            i -= 1;
            if fds[i + 1].revents == 0 {
                continue;
            }
            if let Some(result) = execute(&pending[i].io) {
                let job = pending.swap_remove(i);
                tracing::trace!(thread = id, token = job.token, result, "job done");
                shared.complete(RawCompletion { token: job.token, result });
            }
        }
    }
    tracing::debug!(thread = id, "io thread exiting");
}
