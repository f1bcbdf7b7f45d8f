//! Task record: flags, machine state, awaiting link

use super::engine::StepCx;
use super::flags::{TaskEnd, TaskState};
use crate::error::TaskError;

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared handle to a task.
///
/// Handles keep the record's memory alive; the task's logical lifetime
/// (constructor to destructor) is governed by its flags word only.
pub type TaskHandle = Arc<TaskCell>;

/// Unique task identifier, for logs
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// What a step asks the engine to do next
pub enum Step {
    /// An I/O operation was issued (after `prepare_io`); wait for it
    YieldIo,
    /// Run this freshly created child, resume me when it finishes
    Await(TaskHandle),
    /// Done; run the destructor and resume whoever awaits me
    Finished,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::YieldIo => f.write_str("YieldIo"),
            Step::Await(child) => write!(f, "Await({})", child.id()),
            Step::Finished => f.write_str("Finished"),
        }
    }
}

/// A suspendable computation.
///
/// `construct` builds the state from a parameter, `step` advances it and
/// `destruct` runs exactly once when the task ends, however it ends.
/// Machines never see the flags word; all transitions go through the
/// engine and the [`StepCx`] handed to `step`.
pub trait Machine: Send + Sized + 'static {
    type Param;

    fn construct(param: Self::Param) -> Result<Self, TaskError>;

    fn step(&mut self, cx: &mut StepCx<'_>) -> Step;

    fn destruct(&mut self, _end: TaskEnd) {}
}

pub(crate) trait ErasedMachine: Send {
    fn step(&mut self, cx: &mut StepCx<'_>) -> Step;
    fn destruct(&mut self, end: TaskEnd);
}

impl<M: Machine> ErasedMachine for M {
    fn step(&mut self, cx: &mut StepCx<'_>) -> Step {
        Machine::step(self, cx)
    }

    fn destruct(&mut self, end: TaskEnd) {
        Machine::destruct(self, end)
    }
}

/// Result of an I/O operation, delivered to the task that issued it
#[derive(Debug, Default)]
pub struct IoResult {
    pub ok: bool,
    pub bytes: usize,
    pub os_error: Option<i32>,
    /// Buffer the operation owned while in flight
    pub buf: Option<Vec<u8>>,
}

impl IoResult {
    pub fn success(bytes: usize, buf: Option<Vec<u8>>) -> Self {
        Self { ok: true, bytes, os_error: None, buf }
    }

    pub fn failure(errno: i32, buf: Option<Vec<u8>>) -> Self {
        Self { ok: false, bytes: 0, os_error: Some(errno), buf }
    }
}

/// One task record
pub struct TaskCell {
    id: TaskId,
    name: &'static str,
    pub(crate) flags: AtomicU32,
    /// Only touched by the thread holding RUNNING.
    machine: UnsafeCell<Option<Box<dyn ErasedMachine>>>,
    pub(crate) awaiting: Mutex<Option<TaskHandle>>,
    pub(crate) io: Mutex<Option<IoResult>>,
    pub(crate) await_refused: AtomicBool,
}

// Safety: `machine` is only accessed by the thread that won the RUNNING bit
// through a CAS; everything else is atomics or locks.
unsafe impl Sync for TaskCell {}

impl TaskCell {
    pub(crate) fn new<M: Machine>(machine: M, awaiting: Option<TaskHandle>) -> TaskHandle {
        Arc::new(Self {
            id: TaskId::next(),
            name: short_type_name::<M>(),
            flags: AtomicU32::new(0),
            machine: UnsafeCell::new(Some(Box::new(machine))),
            awaiting: Mutex::new(awaiting),
            io: Mutex::new(None),
            await_refused: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Machine type name, for logs
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_flags(self.flags())
    }

    /// Whether `parent` is the task this one resumes when it finishes.
    pub fn is_awaited_by(&self, parent: &TaskHandle) -> bool {
        self.awaiting
            .lock()
            .as_ref()
            .map_or(false, |p| Arc::ptr_eq(p, parent))
    }

    /// Run one step.
    ///
    /// # Safety
    /// The caller must hold RUNNING for this task.
    pub(crate) unsafe fn step(&self, cx: &mut StepCx<'_>) -> Option<Step> {
        (*self.machine.get()).as_mut().map(|m| m.step(cx))
    }

    /// Take the machine out for destruction.
    ///
    /// # Safety
    /// The caller must hold RUNNING for this task.
    pub(crate) unsafe fn take_machine(&self) -> Option<Box<dyn ErasedMachine>> {
        (*self.machine.get()).take()
    }
}

impl fmt::Debug for TaskCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("flags", &format_args!("{:#09b}", self.flags()))
            .finish()
    }
}

fn short_type_name<M>() -> &'static str {
    let full = std::any::type_name::<M>();
    full.rsplit("::").next().unwrap_or(full)
}
