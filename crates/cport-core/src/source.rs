//! I/O sources: owned descriptors shared between a connection and the
//! operations in flight on it

use crate::error::{PortError, PortResult, SharedResult};
use crate::shared::Retainer;

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// A file or socket descriptor.
///
/// Lives inside a [`Retainer`]; the descriptor is closed when the last
/// retainer goes away. Every operation in flight holds one.
#[derive(Debug)]
pub struct Source {
    fd: OwnedFd,
    registered: AtomicBool,
}

fn log_close(source: &mut Source) {
    tracing::debug!(fd = source.fd.as_raw_fd(), "source closed");
}

impl Source {
    pub fn open(fd: OwnedFd) -> SharedResult<Retainer<Source>> {
        Retainer::make(Source { fd, registered: AtomicBool::new(false) }, Some(log_close))
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Flip the registered bit. Fails if it was already set.
    pub fn mark_registered(&self) -> PortResult<()> {
        self.registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| PortError::AlreadyRegistered(self.fd()))
    }
}

impl AsRawFd for Source {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}
