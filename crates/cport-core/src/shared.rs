//! Atomic shared objects
//!
//! A shared object is one heap block holding a header (reference count,
//! generation tag, optional destructor) followed by the payload. Access goes
//! through [`Retainer`] handles, each of which accounts for one reference.
//!
//! ```text
//! +-----------+-----------+------------+-----------------+
//! | refs: u32 | tag: u64  | destructor |  value: T       |
//! +-----------+-----------+------------+-----------------+
//!   SharedBlock<T> (repr(C), payload at a fixed offset)
//! ```
//!
//! The generation tag comes from a process-wide counter and is copied into
//! every retainer. Retain and release compare the copy against the block, so
//! a handle that outlived its object is caught instead of silently touching
//! reused memory. Tag 0 marks a block that has been freed.
//!
//! Cross-thread handoff: whoever schedules work on another thread's behalf
//! retains *before* the handoff. The retained copy travels with the work,
//! so the object cannot reach zero in the gap before the other thread runs.

use crate::error::{fatal, SharedError, SharedResult};

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

/// First generation tag handed out
pub const TAG_SEED: u64 = 0xa5f4_7ae3;

/// Tag stored in a block once it has been freed
pub const TAG_FREED: u64 = 0;

/// Refuse to go above this many references
const MAX_REFS: u32 = u32::MAX / 2;

static NEXT_TAG: AtomicU64 = AtomicU64::new(TAG_SEED);

fn next_tag() -> u64 {
    loop {
        let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        if tag != TAG_FREED {
            return tag;
        }
    }
}

/// Runs on the payload once, right before it is dropped and freed.
pub type Destructor<T> = fn(&mut T);

#[repr(C)]
struct SharedBlock<T> {
    refs: AtomicU32,
    tag: AtomicU64,
    destructor: Option<Destructor<T>>,
    value: T,
}

/// Counted handle to a shared object.
///
/// A retainer is either live (it owns one reference) or released. Released
/// retainers are inert: `get` returns `None`, `release` is a no-op and
/// `retain` reports [`SharedError::Released`].
pub struct Retainer<T> {
    block: Option<NonNull<SharedBlock<T>>>,
    tag: u64,
    _owns: PhantomData<SharedBlock<T>>,
}

// Safety: the payload is reachable from several threads at once (`&T`) and
// the last release may happen on any thread (drop of `T`).
unsafe impl<T: Send + Sync> Send for Retainer<T> {}
unsafe impl<T: Send + Sync> Sync for Retainer<T> {}

impl<T> Retainer<T> {
    /// Allocate a shared object with refcount 1 and a fresh tag.
    pub fn make(value: T, destructor: Option<Destructor<T>>) -> SharedResult<Self> {
        let layout = Layout::new::<SharedBlock<T>>();
        // Safety: SharedBlock always has a non-zero size (the header).
        let raw = unsafe { alloc::alloc(layout) } as *mut SharedBlock<T>;
        let Some(block) = NonNull::new(raw) else {
            return Err(SharedError::AllocFailed);
        };
        let tag = next_tag();
        // Safety: freshly allocated, correctly laid out for SharedBlock<T>.
        unsafe {
            ptr::write(
                raw,
                SharedBlock {
                    refs: AtomicU32::new(1),
                    tag: AtomicU64::new(tag),
                    destructor,
                    value,
                },
            );
        }
        tracing::trace!(tag, "shared object created");
        Ok(Self { block: Some(block), tag, _owns: PhantomData })
    }

    /// Shorthand for `make(value, None)`.
    pub fn new(value: T) -> SharedResult<Self> {
        Self::make(value, None)
    }

    /// A handle that owns nothing.
    pub const fn released() -> Self {
        Self { block: None, tag: TAG_FREED, _owns: PhantomData }
    }

    #[inline]
    fn header(&self) -> Option<&SharedBlock<T>> {
        // Safety: a live retainer holds a reference, so the block is alive.
        self.block.map(|b| unsafe { &*b.as_ptr() })
    }

    /// Borrow the payload; `None` once released.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        self.header().map(|b| &b.value)
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.block.is_none()
    }

    /// Generation tag carried by this handle (`TAG_FREED` when released).
    #[inline]
    pub fn tag(&self) -> u64 {
        if self.block.is_some() {
            self.tag
        } else {
            TAG_FREED
        }
    }

    /// Current reference count (a snapshot; 0 when released).
    #[inline]
    pub fn strong_count(&self) -> u32 {
        self.header().map_or(0, |b| b.refs.load(Ordering::Acquire))
    }

    /// Whether both handles point at the same live object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        matches!((self.block, other.block), (Some(a), Some(b)) if a == b)
    }

    /// Take another reference, reporting every failure.
    ///
    /// On `Dead`, `Stale` or `Overflow` the increment is rolled back and the
    /// object is left as it was.
    pub fn try_retain(&self) -> SharedResult<Self> {
        let block = self.header().ok_or(SharedError::Released)?;

        let before = block.refs.fetch_add(1, Ordering::Relaxed);
        if before == 0 {
            block.refs.fetch_sub(1, Ordering::Relaxed);
            return Err(SharedError::Dead);
        }
        if before >= MAX_REFS {
            block.refs.fetch_sub(1, Ordering::Relaxed);
            return Err(SharedError::Overflow);
        }
        let found = block.tag.load(Ordering::Acquire);
        if found != self.tag {
            block.refs.fetch_sub(1, Ordering::Relaxed);
            return Err(SharedError::Stale { expected: self.tag, found });
        }

        Ok(Self { block: self.block, tag: self.tag, _owns: PhantomData })
    }

    /// Take another reference.
    ///
    /// A released handle yields `Err(Released)`. Use-after-free symptoms
    /// (`Dead`, `Stale`, `Overflow`) abort the process.
    pub fn retain(&self) -> SharedResult<Self> {
        match self.try_retain() {
            Err(e) if e.is_fatal() => fatal("retain", &e),
            other => other,
        }
    }

    /// Drop this handle's reference, reporting validation failures.
    ///
    /// Returns `Ok(true)` when this call freed the object. Releasing a
    /// released handle is `Ok(false)`. The handle is released afterwards
    /// whatever the outcome.
    pub fn try_release(&mut self) -> SharedResult<bool> {
        let Some(block) = self.block.take() else {
            return Ok(false);
        };
        // Safety: this handle still accounted for one reference.
        let shared = unsafe { &*block.as_ptr() };

        let found = shared.tag.load(Ordering::Acquire);
        if found != self.tag {
            return Err(SharedError::Stale { expected: self.tag, found });
        }

        let before = shared.refs.fetch_sub(1, Ordering::Release);
        if before == 0 {
            shared.refs.fetch_add(1, Ordering::Relaxed);
            return Err(SharedError::Dead);
        }
        if before != 1 {
            return Ok(false);
        }

        fence(Ordering::Acquire);
        // Safety: the 1 -> 0 transition is unique, nobody else can reach it.
        unsafe { destroy(block) };
        Ok(true)
    }

    /// Drop this handle's reference. No-op when already released.
    ///
    /// Returns whether this call freed the object. Validation failures abort.
    pub fn release(&mut self) -> bool {
        match self.try_release() {
            Ok(freed) => freed,
            Err(e) => fatal("release", &e),
        }
    }

    /// Move ownership into a new handle. `self` becomes released; the
    /// reference count does not change.
    #[inline]
    pub fn transfer(&mut self) -> Self {
        Self { block: self.block.take(), tag: self.tag, _owns: PhantomData }
    }

    /// Handle with a forged tag, for exercising stale-tag detection.
    #[cfg(test)]
    pub(crate) fn forged(&self, tag: u64) -> std::mem::ManuallyDrop<Self> {
        std::mem::ManuallyDrop::new(Self { block: self.block, tag, _owns: PhantomData })
    }
}

/// Run the destructor, drop the payload and free the block.
///
/// # Safety
/// The caller must have observed the 1 -> 0 transition for `block`.
unsafe fn destroy<T>(block: NonNull<SharedBlock<T>>) {
    let raw = block.as_ptr();
    let tag = (*raw).tag.swap(TAG_FREED, Ordering::AcqRel);
    if let Some(destructor) = (*raw).destructor {
        destructor(&mut (*raw).value);
    }
    ptr::drop_in_place(raw);
    alloc::dealloc(raw as *mut u8, Layout::new::<SharedBlock<T>>());
    tracing::trace!(tag, "shared object freed");
}

impl<T> Drop for Retainer<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> Default for Retainer<T> {
    fn default() -> Self {
        Self::released()
    }
}

impl<T: fmt::Debug> fmt::Debug for Retainer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f
                .debug_struct("Retainer")
                .field("tag", &format_args!("{:#x}", self.tag))
                .field("refs", &self.strong_count())
                .field("value", value)
                .finish(),
            None => f.write_str("Retainer(released)"),
        }
    }
}
