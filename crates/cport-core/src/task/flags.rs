//! Task flag word and the state derived from it

use core::fmt;

/// A thread is inside the task's step, or owns the task for teardown
pub const RUNNING: u32 = 1 << 0;
/// An I/O operation is armed; only its completion may resume the task
pub const SUSPENDED_IO: u32 = 1 << 1;
/// Blocked until the awaited child finishes
pub const SUSPENDED_AWAIT: u32 = 1 << 2;
/// Teardown requested while the task was running
pub const FORCE_DESTROY: u32 = 1 << 3;
/// The task has been claimed by a driver at least once
pub const STARTED: u32 = 1 << 4;
/// The task ended (or is running its destructor) and will never step again
pub const DESTROYED: u32 = 1 << 5;
/// Set together with DESTROYED when teardown was forced
pub const KILLED: u32 = 1 << 6;

/// Observable state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Constructed, never run
    New = 0,
    /// Inside a step (or being torn down)
    Running = 1,
    /// Waiting for an I/O completion
    SuspendedIo = 2,
    /// Waiting for an awaited child
    SuspendedAwait = 3,
    /// Step reported finished; destructor ran
    Finished = 4,
    /// Destroyed by a forced kill
    Killed = 5,
}

impl TaskState {
    /// Decode a flag word.
    ///
    /// RUNNING wins over the SUSPENDED bits: SUSPENDED_IO is armed before
    /// the step that issued the I/O has returned. A started task with no
    /// other bit is between a resume clearing SUSPENDED_IO and claiming
    /// RUNNING, which counts as running.
    pub const fn from_flags(flags: u32) -> Self {
        if flags & DESTROYED != 0 {
            if flags & KILLED != 0 {
                TaskState::Killed
            } else {
                TaskState::Finished
            }
        } else if flags & RUNNING != 0 {
            TaskState::Running
        } else if flags & SUSPENDED_AWAIT != 0 {
            TaskState::SuspendedAwait
        } else if flags & SUSPENDED_IO != 0 {
            TaskState::SuspendedIo
        } else if flags & STARTED != 0 {
            TaskState::Running
        } else {
            TaskState::New
        }
    }

    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Killed)
    }

    #[inline]
    pub const fn is_suspended(&self) -> bool {
        matches!(self, TaskState::SuspendedIo | TaskState::SuspendedAwait)
    }
}

impl From<u8> for TaskState {
    fn from(v: u8) -> Self {
        match v {
            1 => TaskState::Running,
            2 => TaskState::SuspendedIo,
            3 => TaskState::SuspendedAwait,
            4 => TaskState::Finished,
            5 => TaskState::Killed,
            _ => TaskState::New,
        }
    }
}

impl From<TaskState> for u8 {
    fn from(state: TaskState) -> u8 {
        state as u8
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::New => "NEW",
            TaskState::Running => "RUNNING",
            TaskState::SuspendedIo => "SUSPENDED_IO",
            TaskState::SuspendedAwait => "SUSPENDED_AWAIT",
            TaskState::Finished => "FINISHED",
            TaskState::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// How a task's life ended, passed to its destructor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEnd {
    /// The step returned `Finished`
    Finished,
    /// Forced teardown (kill, refused await, contract violation)
    Killed,
}
