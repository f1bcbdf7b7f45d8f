//! Linux futex-based parking
//!
//! The futex word is a wake epoch. Parking sleeps only while the word still
//! holds the epoch the caller saw before it last checked for work; every
//! wake bumps the word first, then calls FUTEX_WAKE.

use super::WaiterParking;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub struct FutexParking {
    epoch: AtomicU32,
    parked: AtomicUsize,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    fn futex_wake(&self, n: i32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.epoch.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn bump_and_wake(&self, n: i32) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if self.parked.load(Ordering::Acquire) != 0 {
            self.futex_wake(n);
        }
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl WaiterParking for FutexParking {
    #[inline]
    fn prepare(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    fn park(&self, epoch: u32, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);

        if self.epoch.load(Ordering::Acquire) != epoch {
            self.parked.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        // FUTEX_WAIT: sleep while the word still equals `epoch`
        let result = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.epoch.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                epoch,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        let errno = nix::errno::Errno::last_raw();

        self.parked.fetch_sub(1, Ordering::SeqCst);

        if result == 0 {
            true
        } else {
            // ETIMEDOUT, EAGAIN (epoch moved) and EINTR are all "not signalled"
            errno != libc::ETIMEDOUT && errno != libc::EAGAIN && errno != libc::EINTR
        }
    }

    fn wake_one(&self) {
        self.bump_and_wake(1);
    }

    fn wake_all(&self) {
        self.bump_and_wake(i32::MAX);
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
