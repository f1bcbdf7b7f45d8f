//! Completion backends and backend selection

mod threaded;
mod uring;

pub use threaded::ThreadedBackend;
pub use uring::UringBackend;

use crate::config::{BackendKind, RuntimeConfig};
use cport_core::backend::CompletionBackend;
use cport_core::error::{PortError, PortResult};

use nix::fcntl::{fcntl, FcntlArg};
use std::os::fd::RawFd;

/// Fail with the OS error if `fd` is not an open descriptor.
pub(crate) fn check_fd(fd: RawFd) -> PortResult<()> {
    fcntl(fd, FcntlArg::F_GETFD)
        .map(|_| ())
        .map_err(|errno| PortError::Os(errno as i32))
}

/// Build the backend `config` asks for.
///
/// `Auto` tries io_uring first and falls back to the threaded backend when
/// the ring cannot be set up (old kernel, seccomp, container policy).
pub fn open(config: &RuntimeConfig) -> PortResult<Box<dyn CompletionBackend>> {
    match config.backend {
        BackendKind::Uring => Ok(Box::new(UringBackend::new(config.ring_entries)?)),
        BackendKind::Threaded => Ok(Box::new(ThreadedBackend::new(config)?)),
        BackendKind::Auto => match UringBackend::new(config.ring_entries) {
            Ok(b) => Ok(Box::new(b)),
            Err(e) => {
                tracing::warn!(error = %e, "io_uring unavailable, using the threaded backend");
                Ok(Box::new(ThreadedBackend::new(config)?))
            }
        },
    }
}
