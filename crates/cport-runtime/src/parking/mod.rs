//! Parking for threads blocked in a completion wait
//!
//! The threaded backend parks its waiters here when the completion queue
//! is empty. Waiters follow a prepare / re-check / park sequence:
//!
//! ```ignore
//! let epoch = parking.prepare();
//! if let Some(c) = queue.pop() { return c; }
//! parking.park(epoch, Some(timeout));
//! ```
//!
//! A wake that lands between `prepare` and `park` bumps the epoch, so the
//! park returns at once instead of sleeping through it.

use std::time::Duration;

mod futex_linux;
pub use futex_linux::FutexParking;

pub trait WaiterParking: Send + Sync {
    /// Snapshot the wake epoch before checking for work.
    fn prepare(&self) -> u32;

    /// Sleep until woken, unless a wake happened since `prepare`.
    ///
    /// Returns `true` if woken by a signal, `false` on timeout, a missed
    /// epoch, or a spurious return. Callers re-check their queue either way.
    fn park(&self, epoch: u32, timeout: Option<Duration>) -> bool;

    /// Wake one parked thread
    fn wake_one(&self);

    /// Wake every parked thread (close, shutdown)
    fn wake_all(&self);

    /// Number of currently parked threads (hint, may be stale)
    fn parked_count(&self) -> usize;
}
