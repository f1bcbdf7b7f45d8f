//! The driver: runs steps and moves tasks between states
//!
//! # Ownership of a task
//!
//! Whoever sets RUNNING (through a CAS) owns the task until it clears the
//! bit again or destroys the task. Only the owner runs the step, touches
//! the machine, or runs the destructor. The CAS sites are:
//!
//! | entry            | from                    | to                       |
//! |------------------|-------------------------|--------------------------|
//! | `start`          | 0                       | STARTED, RUNNING         |
//! | await a child    | 0                       | STARTED, RUNNING         |
//! | `resume_io`      | SUSPENDED_IO (cleared), then !RUNNING | RUNNING    |
//! | child finished   | SUSPENDED_AWAIT         | RUNNING                  |
//! | `kill`           | !RUNNING                | RUNNING, FORCE_DESTROY   |
//!
//! A kill that finds RUNNING only sets FORCE_DESTROY; the owner notices it
//! after the step returns and tears the task down itself.
//!
//! # Work list
//!
//! `drive` processes one task at a time. Awaiting a child hands the child to
//! the next iteration; a finishing child hands back its parent. Await chains
//! of any depth run in constant stack space, and a parent resumes on the
//! same driver call that finished its child.

use super::cell::{IoResult, Machine, Step, TaskCell, TaskHandle};
use super::flags::*;
use crate::error::{fatal, TaskError, TaskResult};

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// What happens to a task whose await was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AwaitRejectPolicy {
    /// Leave it suspended; only `resume_from_await` or `kill` move it again
    Park,
    /// Tear it down together with everything awaiting it
    #[default]
    Kill,
}

impl FromStr for AwaitRejectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "park" => Ok(AwaitRejectPolicy::Park),
            "kill" => Ok(AwaitRejectPolicy::Kill),
            other => Err(format!("unknown await policy '{}'", other)),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Busy spins while waiting for a previous step to let go of RUNNING,
    /// before falling back to `yield_now`
    pub resume_spin_limit: u32,
    pub await_reject: AwaitRejectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resume_spin_limit: 1024,
            await_reject: AwaitRejectPolicy::Kill,
        }
    }
}

/// Outcome of [`Engine::kill`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The task and its awaiting chain were destroyed
    Destroyed,
    /// The task is running; its driver destroys it after the current step
    Deferred,
    /// Already finished or killed
    AlreadyDead,
}

enum Claim {
    Owned(TaskHandle),
    Deferred,
    Dead,
}

/// Counters snapshot
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub started: u64,
    pub finished: u64,
    pub killed: u64,
    pub refused_awaits: u64,
    pub refused_resumes: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    finished: AtomicU64,
    killed: AtomicU64,
    refused_awaits: AtomicU64,
    refused_resumes: AtomicU64,
}

/// Step context handed to [`Machine::step`]
pub struct StepCx<'a> {
    engine: &'a Engine,
    task: &'a TaskHandle,
    io_armed: bool,
}

impl<'a> StepCx<'a> {
    /// The task being stepped
    #[inline]
    pub fn task(&self) -> &TaskHandle {
        self.task
    }

    #[inline]
    pub fn engine(&self) -> &Engine {
        self.engine
    }

    /// Arm SUSPENDED_IO before issuing an operation.
    ///
    /// The completion may be picked up by another worker before this step
    /// returns; the flag has to be there when it looks.
    pub fn prepare_io(&mut self) {
        self.task.flags.fetch_or(SUSPENDED_IO, Ordering::AcqRel);
        self.io_armed = true;
    }

    /// Disarm SUSPENDED_IO after an operation failed to queue.
    pub fn cancel_io(&mut self) {
        self.task.flags.fetch_and(!SUSPENDED_IO, Ordering::AcqRel);
        self.io_armed = false;
    }

    #[inline]
    pub fn io_armed(&self) -> bool {
        self.io_armed
    }

    /// Result stored by the completion that resumed this task.
    pub fn take_io(&self) -> Option<IoResult> {
        self.task.io.lock().take()
    }

    /// Construct a child linked back to this task. Return
    /// `Step::Await(child)` to run it.
    pub fn await_async<M: Machine>(&self, param: M::Param) -> TaskResult<TaskHandle> {
        let machine = M::construct(param)?;
        Ok(TaskCell::new(machine, Some(self.task.clone())))
    }

    /// Whether the last await of this task was refused (parking policy).
    pub fn await_refused(&self) -> bool {
        self.task.await_refused.swap(false, Ordering::AcqRel)
    }
}

/// The task driver
pub struct Engine {
    config: EngineConfig,
    counters: Counters,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config, counters: Counters::default() }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            started: c.started.load(Ordering::Relaxed),
            finished: c.finished.load(Ordering::Relaxed),
            killed: c.killed.load(Ordering::Relaxed),
            refused_awaits: c.refused_awaits.load(Ordering::Relaxed),
            refused_resumes: c.refused_resumes.load(Ordering::Relaxed),
        }
    }

    /// Construct a task without running it.
    pub fn spawn<M: Machine>(&self, param: M::Param) -> TaskResult<TaskHandle> {
        let machine = M::construct(param)?;
        Ok(TaskCell::new(machine, None))
    }

    /// Construct and start a task on the calling thread.
    pub fn run<M: Machine>(&self, param: M::Param) -> TaskResult<TaskHandle> {
        let task = self.spawn::<M>(param)?;
        self.start(&task)?;
        Ok(task)
    }

    /// Run a fresh task until it suspends or ends.
    ///
    /// Starting a task that another thread is driving is a contract
    /// violation: the task is killed and `AlreadyRunning` returned.
    pub fn start(&self, task: &TaskHandle) -> TaskResult<()> {
        match task.flags.compare_exchange(
            0,
            STARTED | RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.counters.started.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(task = %task.id(), name = task.name(), "task started");
                self.drive(task.clone());
                Ok(())
            }
            Err(cur) if cur & RUNNING != 0 => {
                tracing::error!(task = %task.id(), "start on a task that is already running, killing it");
                self.kill(task);
                Err(TaskError::AlreadyRunning)
            }
            Err(cur) if cur & DESTROYED != 0 => Err(TaskError::Destroyed),
            Err(_) => Err(TaskError::NotFresh),
        }
    }

    /// Resume a task whose I/O completed.
    ///
    /// Clears SUSPENDED_IO (refusing if it is not set), waits for the step
    /// that issued the operation to let go of RUNNING, takes RUNNING,
    /// stores `io` and drives the task.
    pub fn resume_io(&self, task: TaskHandle, io: IoResult) -> TaskResult<()> {
        let mut cur = task.flags.load(Ordering::Acquire);
        loop {
            if cur & DESTROYED != 0 {
                return Err(TaskError::Destroyed);
            }
            if cur & SUSPENDED_IO == 0 {
                self.counters.refused_resumes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(task = %task.id(), flags = cur, "I/O resume refused");
                return Err(TaskError::NotSuspended);
            }
            match task.flags.compare_exchange_weak(
                cur,
                cur & !SUSPENDED_IO,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        let mut spins = 0u32;
        loop {
            let cur = task.flags.load(Ordering::Acquire);
            if cur & DESTROYED != 0 {
                return Err(TaskError::Destroyed);
            }
            if cur & RUNNING == 0 {
                if task
                    .flags
                    .compare_exchange_weak(cur, cur | RUNNING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
                continue;
            }
            if spins < self.config.resume_spin_limit {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }

        *task.io.lock() = Some(io);
        self.drive(task);
        Ok(())
    }

    /// Resume a task parked in SUSPENDED_AWAIT from outside the engine.
    pub fn resume_from_await(&self, task: TaskHandle) -> TaskResult<()> {
        self.claim_from_await(&task)?;
        self.drive(task);
        Ok(())
    }

    /// Request teardown of a task and everything awaiting it.
    pub fn kill(&self, task: &TaskHandle) -> KillOutcome {
        match self.claim_for_kill(task.clone()) {
            Claim::Owned(task) => {
                self.destroy_chain(task);
                KillOutcome::Destroyed
            }
            Claim::Deferred => KillOutcome::Deferred,
            Claim::Dead => KillOutcome::AlreadyDead,
        }
    }

    fn drive(&self, task: TaskHandle) {
        let mut next = Some(task);
        while let Some(task) = next {
            next = self.run_once(task);
        }
    }

    /// One step of an owned task; returns the next task to own, if any.
    fn run_once(&self, task: TaskHandle) -> Option<TaskHandle> {
        if task.flags() & FORCE_DESTROY != 0 {
            self.destroy_chain(task);
            return None;
        }

        let (step, io_armed) = {
            let mut cx = StepCx { engine: self, task: &task, io_armed: false };
            // Safety: we hold RUNNING.
            let step = unsafe { task.step(&mut cx) };
            (step, cx.io_armed)
        };
        let Some(step) = step else {
            fatal("step", &format_args!("task {} has no machine while running", task.id()))
        };
        tracing::trace!(task = %task.id(), ?step, "step returned");

        if task.flags() & FORCE_DESTROY != 0 {
            if let Step::Await(child) = step {
                self.discard_child(child);
            }
            self.destroy_chain(task);
            return None;
        }

        match step {
            Step::YieldIo if !io_armed => {
                tracing::error!(task = %task.id(), "yielded for I/O without an armed operation, killing");
                self.destroy_chain(task);
                None
            }
            Step::YieldIo => {
                if !self.suspend(&task, 0) {
                    self.destroy_chain(task);
                }
                None
            }
            Step::Await(child) if io_armed => {
                // The armed completion would resume the task while it awaits.
                self.counters.refused_awaits.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    task = %task.id(),
                    child = %child.id(),
                    "awaited a child with I/O armed, killing"
                );
                self.discard_child(child);
                self.destroy_chain(task);
                None
            }
            Step::Await(child) => self.begin_await(task, child),
            Step::Finished => {
                if !self.commit_finish(&task) {
                    self.destroy_chain(task);
                    return None;
                }
                let parent = self.destroy(&task, TaskEnd::Finished);
                parent.and_then(|p| self.wake_parent(p))
            }
        }
    }

    /// Mark a finishing task destroyed, unless a kill arrived after the
    /// step returned. Later kills see it as dead.
    fn commit_finish(&self, task: &TaskHandle) -> bool {
        let mut cur = task.flags.load(Ordering::Acquire);
        loop {
            if cur & FORCE_DESTROY != 0 {
                return false;
            }
            match task.flags.compare_exchange_weak(
                cur,
                cur | DESTROYED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drop RUNNING and set `bits`, unless a kill arrived meanwhile.
    fn suspend(&self, task: &TaskHandle, bits: u32) -> bool {
        let mut cur = task.flags.load(Ordering::Acquire);
        loop {
            if cur & FORCE_DESTROY != 0 {
                return false;
            }
            match task.flags.compare_exchange_weak(
                cur,
                (cur & !RUNNING) | bits,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn begin_await(&self, parent: TaskHandle, child: TaskHandle) -> Option<TaskHandle> {
        if !child.is_awaited_by(&parent) {
            return self.refuse_await(parent, &child, TaskError::NotAwaitingCaller);
        }
        if child
            .flags
            .compare_exchange(0, STARTED | RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.refuse_await(parent, &child, TaskError::NotFresh);
        }
        self.counters.started.fetch_add(1, Ordering::Relaxed);

        if !self.suspend(&parent, SUSPENDED_AWAIT) {
            self.destroy(&child, TaskEnd::Killed);
            self.destroy_chain(parent);
            return None;
        }
        tracing::trace!(parent = %parent.id(), child = %child.id(), "awaiting child");
        Some(child)
    }

    fn refuse_await(
        &self,
        parent: TaskHandle,
        child: &TaskHandle,
        err: TaskError,
    ) -> Option<TaskHandle> {
        self.counters.refused_awaits.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            task = %parent.id(),
            child = %child.id(),
            error = %err,
            policy = ?self.config.await_reject,
            "await refused"
        );
        match self.config.await_reject {
            AwaitRejectPolicy::Kill => self.destroy_chain(parent),
            AwaitRejectPolicy::Park => {
                parent.await_refused.store(true, Ordering::Release);
                if !self.suspend(&parent, SUSPENDED_AWAIT) {
                    self.destroy_chain(parent);
                }
            }
        }
        None
    }

    /// Child of a task that is being torn down before the child ran.
    fn discard_child(&self, child: TaskHandle) {
        if child
            .flags
            .compare_exchange(0, STARTED | RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.destroy(&child, TaskEnd::Killed);
        }
    }

    fn claim_from_await(&self, task: &TaskHandle) -> TaskResult<()> {
        let mut cur = task.flags.load(Ordering::Acquire);
        loop {
            if cur & DESTROYED != 0 {
                return Err(TaskError::Destroyed);
            }
            if cur & SUSPENDED_AWAIT == 0 || cur & RUNNING != 0 {
                return Err(TaskError::NotSuspended);
            }
            match task.flags.compare_exchange_weak(
                cur,
                (cur & !SUSPENDED_AWAIT) | RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    fn wake_parent(&self, parent: TaskHandle) -> Option<TaskHandle> {
        match self.claim_from_await(&parent) {
            Ok(()) => {
                tracing::trace!(task = %parent.id(), "resumed from await");
                Some(parent)
            }
            Err(err) => {
                self.counters.refused_resumes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(task = %parent.id(), error = %err, "parent resume refused");
                None
            }
        }
    }

    fn claim_for_kill(&self, task: TaskHandle) -> Claim {
        let mut cur = task.flags.load(Ordering::Acquire);
        loop {
            if cur & DESTROYED != 0 {
                return Claim::Dead;
            }
            let running = cur & RUNNING != 0;
            let next = if running {
                cur | FORCE_DESTROY
            } else {
                cur | STARTED | RUNNING | FORCE_DESTROY
            };
            match task
                .flags
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if running => return Claim::Deferred,
                Ok(_) => return Claim::Owned(task),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Destroy an owned task, then every ancestor that can be claimed.
    fn destroy_chain(&self, task: TaskHandle) {
        let mut next = Some(task);
        while let Some(task) = next {
            next = self
                .destroy(&task, TaskEnd::Killed)
                .and_then(|parent| match self.claim_for_kill(parent) {
                    Claim::Owned(parent) => Some(parent),
                    Claim::Deferred | Claim::Dead => None,
                });
        }
    }

    /// Run the destructor of an owned task and mark it destroyed.
    /// Returns the parent that was awaiting it.
    fn destroy(&self, task: &TaskHandle, end: TaskEnd) -> Option<TaskHandle> {
        // Safety: we hold RUNNING.
        if let Some(mut machine) = unsafe { task.take_machine() } {
            machine.destruct(end);
        }
        task.io.lock().take();
        let parent = task.awaiting.lock().take();

        let mark = match end {
            TaskEnd::Finished => {
                self.counters.finished.fetch_add(1, Ordering::Relaxed);
                DESTROYED
            }
            TaskEnd::Killed => {
                self.counters.killed.fetch_add(1, Ordering::Relaxed);
                DESTROYED | KILLED
            }
        };
        task.flags.store(mark, Ordering::Release);
        tracing::debug!(task = %task.id(), name = task.name(), ?end, "task destroyed");
        parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{mpsc, Arc, Barrier};
    use std::thread;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Awaits a chain of `nesting` children; the leaf finishes at once.
    struct Nest {
        nesting: u32,
        log: Log,
        awaited: bool,
    }

    impl Machine for Nest {
        type Param = (u32, Log);

        fn construct((nesting, log): Self::Param) -> Result<Self, TaskError> {
            Ok(Self { nesting, log, awaited: false })
        }

        fn step(&mut self, cx: &mut StepCx<'_>) -> Step {
            if self.nesting > 0 && !self.awaited {
                self.awaited = true;
                return match cx.await_async::<Nest>((self.nesting - 1, self.log.clone())) {
                    Ok(child) => Step::Await(child),
                    Err(_) => Step::Finished,
                };
            }
            if self.awaited {
                self.log.lock().push(format!("resume {}", self.nesting));
            }
            self.log.lock().push(format!("finish {}", self.nesting));
            Step::Finished
        }

        fn destruct(&mut self, end: TaskEnd) {
            self.log.lock().push(format!("destruct {} {:?}", self.nesting, end));
        }
    }

    #[test]
    fn test_nested_await_resumes_lifo() {
        let engine = Engine::default();
        let log: Log = Arc::default();
        let root = engine.run::<Nest>((2, log.clone())).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "finish 0",
                "destruct 0 Finished",
                "resume 1",
                "finish 1",
                "destruct 1 Finished",
                "resume 2",
                "finish 2",
                "destruct 2 Finished",
            ]
        );
        assert_eq!(root.state(), TaskState::Finished);
        let stats = engine.stats();
        assert_eq!(stats.started, 3);
        assert_eq!(stats.finished, 3);
        assert_eq!(stats.killed, 0);
    }

    #[test]
    fn test_deep_await_chain_constant_stack() {
        let engine = Engine::default();
        let log: Log = Arc::default();
        let depth = 50_000;

        // Run on a small stack: recursion per level would overflow it.
        let handle = thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || {
                engine.run::<Nest>((depth, log.clone())).unwrap();
                (engine.stats(), log.lock().len())
            })
            .unwrap();
        let (stats, entries) = handle.join().unwrap();
        assert_eq!(stats.finished, u64::from(depth) + 1);
        // finish + destruct per task, plus a resume for every non-leaf
        assert_eq!(entries, 3 * depth as usize + 2);
    }

    /// Arms I/O and yields until it has been resumed `rounds` times.
    struct Io {
        rounds: usize,
        seen: Arc<AtomicUsize>,
        ends: Arc<Mutex<Vec<TaskEnd>>>,
    }

    impl Machine for Io {
        type Param = (usize, Arc<AtomicUsize>, Arc<Mutex<Vec<TaskEnd>>>);

        fn construct((rounds, seen, ends): Self::Param) -> Result<Self, TaskError> {
            Ok(Self { rounds, seen, ends })
        }

        fn step(&mut self, cx: &mut StepCx<'_>) -> Step {
            if cx.take_io().is_some() {
                self.seen.fetch_add(1, Ordering::SeqCst);
            }
            if self.seen.load(Ordering::SeqCst) >= self.rounds {
                return Step::Finished;
            }
            cx.prepare_io();
            Step::YieldIo
        }

        fn destruct(&mut self, end: TaskEnd) {
            self.ends.lock().push(end);
        }
    }

    fn io_task(
        engine: &Engine,
        rounds: usize,
    ) -> (TaskHandle, Arc<AtomicUsize>, Arc<Mutex<Vec<TaskEnd>>>) {
        let seen = Arc::new(AtomicUsize::new(0));
        let ends = Arc::new(Mutex::new(Vec::new()));
        let task = engine
            .run::<Io>((rounds, seen.clone(), ends.clone()))
            .unwrap();
        (task, seen, ends)
    }

    #[test]
    fn test_io_suspend_and_resume() {
        let engine = Engine::default();
        let (task, seen, ends) = io_task(&engine, 2);
        assert_eq!(task.state(), TaskState::SuspendedIo);

        engine.resume_io(task.clone(), IoResult::success(3, None)).unwrap();
        assert_eq!(task.state(), TaskState::SuspendedIo);
        engine.resume_io(task.clone(), IoResult::success(3, None)).unwrap();
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(*ends.lock(), vec![TaskEnd::Finished]);

        assert_eq!(
            engine.resume_io(task, IoResult::default()),
            Err(TaskError::Destroyed)
        );
    }

    #[test]
    fn test_resume_io_refused_when_not_suspended() {
        let engine = Engine::default();
        let log: Log = Arc::default();
        let task = engine.spawn::<Nest>((0, log)).unwrap();
        assert_eq!(
            engine.resume_io(task.clone(), IoResult::default()),
            Err(TaskError::NotSuspended)
        );
        assert_eq!(task.state(), TaskState::New);
        assert_eq!(engine.stats().refused_resumes, 1);
    }

    /// Awaits a child it has already started elsewhere, or a stranger.
    struct BadAwait {
        stranger: bool,
        ends: Arc<Mutex<Vec<(&'static str, TaskEnd)>>>,
        stepped: usize,
        refused_seen: Arc<AtomicBool>,
    }

    struct Leaf {
        ends: Arc<Mutex<Vec<(&'static str, TaskEnd)>>>,
    }

    impl Machine for Leaf {
        type Param = Arc<Mutex<Vec<(&'static str, TaskEnd)>>>;

        fn construct(ends: Self::Param) -> Result<Self, TaskError> {
            Ok(Self { ends })
        }

        fn step(&mut self, cx: &mut StepCx<'_>) -> Step {
            cx.prepare_io();
            Step::YieldIo
        }

        fn destruct(&mut self, end: TaskEnd) {
            self.ends.lock().push(("leaf", end));
        }
    }

    impl Machine for BadAwait {
        type Param = (bool, Arc<Mutex<Vec<(&'static str, TaskEnd)>>>, Arc<AtomicBool>);

        fn construct((stranger, ends, refused_seen): Self::Param) -> Result<Self, TaskError> {
            Ok(Self { stranger, ends, stepped: 0, refused_seen })
        }

        fn step(&mut self, cx: &mut StepCx<'_>) -> Step {
            self.stepped += 1;
            if self.stepped > 1 {
                self.refused_seen.store(cx.await_refused(), Ordering::SeqCst);
                return Step::Finished;
            }
            let child = if self.stranger {
                cx.engine().spawn::<Leaf>(self.ends.clone())
            } else {
                cx.await_async::<Leaf>(self.ends.clone())
            };
            let Ok(child) = child else { return Step::Finished };
            if !self.stranger {
                // Runs the child to its first suspension: no longer fresh.
                let _ = cx.engine().start(&child);
            }
            Step::Await(child)
        }

        fn destruct(&mut self, end: TaskEnd) {
            self.ends.lock().push(("parent", end));
        }
    }

    #[test]
    fn test_await_not_fresh_kill_policy() {
        let engine = Engine::new(EngineConfig {
            await_reject: AwaitRejectPolicy::Kill,
            ..EngineConfig::default()
        });
        let ends = Arc::new(Mutex::new(Vec::new()));
        let refused = Arc::new(AtomicBool::new(false));
        let parent = engine
            .run::<BadAwait>((false, ends.clone(), refused.clone()))
            .unwrap();

        assert_eq!(parent.state(), TaskState::Killed);
        assert_eq!(*ends.lock(), vec![("parent", TaskEnd::Killed)]);
        assert_eq!(engine.stats().refused_awaits, 1);
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_await_not_fresh_park_policy() {
        let engine = Engine::new(EngineConfig {
            await_reject: AwaitRejectPolicy::Park,
            ..EngineConfig::default()
        });
        let ends = Arc::new(Mutex::new(Vec::new()));
        let refused = Arc::new(AtomicBool::new(false));
        let parent = engine
            .run::<BadAwait>((false, ends.clone(), refused.clone()))
            .unwrap();

        assert!(logs_contain("await refused"));
        assert_eq!(parent.state(), TaskState::SuspendedAwait);
        assert!(ends.lock().is_empty());

        // Parked: not resumable through the I/O path, only from await.
        assert_eq!(
            engine.resume_io(parent.clone(), IoResult::default()),
            Err(TaskError::NotSuspended)
        );
        engine.resume_from_await(parent.clone()).unwrap();
        assert!(refused.load(Ordering::SeqCst));
        assert_eq!(parent.state(), TaskState::Finished);
        assert_eq!(*ends.lock(), vec![("parent", TaskEnd::Finished)]);
    }

    #[test]
    fn test_await_stranger_is_refused() {
        let engine = Engine::new(EngineConfig {
            await_reject: AwaitRejectPolicy::Park,
            ..EngineConfig::default()
        });
        let ends = Arc::new(Mutex::new(Vec::new()));
        let refused = Arc::new(AtomicBool::new(false));
        let parent = engine
            .run::<BadAwait>((true, ends.clone(), refused.clone()))
            .unwrap();

        assert_eq!(parent.state(), TaskState::SuspendedAwait);
        assert_eq!(engine.stats().refused_awaits, 1);
        // The stranger was never claimed.
        assert_eq!(engine.stats().started, 1);
        assert_eq!(engine.kill(&parent), KillOutcome::Destroyed);
        assert_eq!(*ends.lock(), vec![("parent", TaskEnd::Killed)]);
    }

    /// Chain whose leaf parks on I/O and publishes its handle.
    struct Chain {
        nesting: u32,
        slot: Arc<Mutex<Option<TaskHandle>>>,
        ends: Arc<AtomicUsize>,
        awaited: bool,
    }

    impl Machine for Chain {
        type Param = (u32, Arc<Mutex<Option<TaskHandle>>>, Arc<AtomicUsize>);

        fn construct((nesting, slot, ends): Self::Param) -> Result<Self, TaskError> {
            Ok(Self { nesting, slot, ends, awaited: false })
        }

        fn step(&mut self, cx: &mut StepCx<'_>) -> Step {
            if self.nesting == 0 {
                *self.slot.lock() = Some(cx.task().clone());
                cx.prepare_io();
                return Step::YieldIo;
            }
            if self.awaited {
                return Step::Finished;
            }
            self.awaited = true;
            match cx.await_async::<Chain>((self.nesting - 1, self.slot.clone(), self.ends.clone())) {
                Ok(child) => Step::Await(child),
                Err(_) => Step::Finished,
            }
        }

        fn destruct(&mut self, end: TaskEnd) {
            assert_eq!(end, TaskEnd::Killed);
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_kill_propagates_to_all_ancestors() {
        const ANCESTORS: u32 = 4;
        let engine = Engine::default();
        let slot = Arc::new(Mutex::new(None));
        let ends = Arc::new(AtomicUsize::new(0));
        let root = engine
            .run::<Chain>((ANCESTORS, slot.clone(), ends.clone()))
            .unwrap();
        let leaf = slot.lock().take().unwrap();

        assert_eq!(root.state(), TaskState::SuspendedAwait);
        assert_eq!(leaf.state(), TaskState::SuspendedIo);

        assert_eq!(engine.kill(&leaf), KillOutcome::Destroyed);
        assert_eq!(ends.load(Ordering::SeqCst), ANCESTORS as usize + 1);
        assert_eq!(engine.stats().killed, u64::from(ANCESTORS) + 1);
        assert_eq!(root.state(), TaskState::Killed);

        // Late completion for the dead leaf is refused, nothing runs twice.
        assert_eq!(
            engine.resume_io(leaf.clone(), IoResult::default()),
            Err(TaskError::Destroyed)
        );
        assert_eq!(engine.kill(&leaf), KillOutcome::AlreadyDead);
        assert_eq!(ends.load(Ordering::SeqCst), ANCESTORS as usize + 1);
    }

    #[test]
    fn test_kill_fresh_task() {
        let engine = Engine::default();
        let (seen, ends) = (Arc::new(AtomicUsize::new(0)), Arc::new(Mutex::new(Vec::new())));
        let task = engine.spawn::<Io>((1, seen, ends.clone())).unwrap();
        assert_eq!(engine.kill(&task), KillOutcome::Destroyed);
        assert_eq!(*ends.lock(), vec![TaskEnd::Killed]);
        assert_eq!(engine.start(&task), Err(TaskError::Destroyed));
    }

    /// Blocks inside its step until told to go on.
    struct Gate {
        entered: Arc<Barrier>,
        release: Option<mpsc::Receiver<()>>,
        ends: Arc<Mutex<Vec<TaskEnd>>>,
    }

    impl Machine for Gate {
        type Param = (Arc<Barrier>, mpsc::Receiver<()>, Arc<Mutex<Vec<TaskEnd>>>);

        fn construct((entered, release, ends): Self::Param) -> Result<Self, TaskError> {
            Ok(Self { entered, release: Some(release), ends })
        }

        fn step(&mut self, _cx: &mut StepCx<'_>) -> Step {
            self.entered.wait();
            if let Some(rx) = self.release.take() {
                let _ = rx.recv();
            }
            Step::Finished
        }

        fn destruct(&mut self, end: TaskEnd) {
            self.ends.lock().push(end);
        }
    }

    #[test]
    fn test_start_while_running_kills_task() {
        let engine = Arc::new(Engine::default());
        let entered = Arc::new(Barrier::new(2));
        let (tx, rx) = mpsc::channel();
        let ends = Arc::new(Mutex::new(Vec::new()));
        let task = engine
            .spawn::<Gate>((entered.clone(), rx, ends.clone()))
            .unwrap();

        let driver = {
            let (engine, task) = (engine.clone(), task.clone());
            thread::spawn(move || engine.start(&task))
        };
        entered.wait();

        assert_eq!(engine.start(&task), Err(TaskError::AlreadyRunning));
        assert_ne!(task.flags() & FORCE_DESTROY, 0);
        tx.send(()).unwrap();
        driver.join().unwrap().unwrap();

        // The step reported Finished, but the kill request wins.
        assert_eq!(task.state(), TaskState::Killed);
        assert_eq!(*ends.lock(), vec![TaskEnd::Killed]);
    }

    struct Lazy;

    impl Machine for Lazy {
        type Param = ();

        fn construct(_: ()) -> Result<Self, TaskError> {
            Ok(Lazy)
        }

        fn step(&mut self, _cx: &mut StepCx<'_>) -> Step {
            Step::YieldIo
        }
    }

    #[test]
    fn test_yield_without_prepare_is_killed() {
        let engine = Engine::default();
        let task = engine.run::<Lazy>(()).unwrap();
        assert_eq!(task.state(), TaskState::Killed);
    }

    /// Arms I/O, then awaits a child in the same step.
    struct ArmsThenAwaits {
        ends: Arc<Mutex<Vec<(&'static str, TaskEnd)>>>,
        slot: Arc<Mutex<Option<TaskHandle>>>,
    }

    impl Machine for ArmsThenAwaits {
        type Param = (Arc<Mutex<Vec<(&'static str, TaskEnd)>>>, Arc<Mutex<Option<TaskHandle>>>);

        fn construct((ends, slot): Self::Param) -> Result<Self, TaskError> {
            Ok(Self { ends, slot })
        }

        fn step(&mut self, cx: &mut StepCx<'_>) -> Step {
            cx.prepare_io();
            match cx.await_async::<Leaf>(self.ends.clone()) {
                Ok(child) => {
                    *self.slot.lock() = Some(child.clone());
                    Step::Await(child)
                }
                Err(_) => Step::Finished,
            }
        }

        fn destruct(&mut self, end: TaskEnd) {
            self.ends.lock().push(("parent", end));
        }
    }

    #[test]
    fn test_await_with_armed_io_is_refused() {
        for policy in [AwaitRejectPolicy::Kill, AwaitRejectPolicy::Park] {
            let engine = Engine::new(EngineConfig {
                await_reject: policy,
                ..EngineConfig::default()
            });
            let ends = Arc::new(Mutex::new(Vec::new()));
            let slot = Arc::new(Mutex::new(None));
            let parent = engine
                .run::<ArmsThenAwaits>((ends.clone(), slot.clone()))
                .unwrap();
            let child = slot.lock().take().unwrap();

            // Never suspended on both I/O and await, whatever the policy.
            assert_eq!(parent.state(), TaskState::Killed, "{:?}", policy);
            assert_eq!(child.state(), TaskState::Killed);
            assert_eq!(
                *ends.lock(),
                vec![("leaf", TaskEnd::Killed), ("parent", TaskEnd::Killed)]
            );

            // The completion of the armed operation finds nothing to run.
            assert_eq!(
                engine.resume_io(parent.clone(), IoResult::success(1, None)),
                Err(TaskError::Destroyed)
            );
            let stats = engine.stats();
            assert_eq!(stats.refused_awaits, 1);
            assert_eq!(stats.killed, 2);
            assert_eq!(stats.finished, 0);
        }
    }

    #[test]
    fn test_kill_after_step_returned_wins_over_finish() {
        let engine = Engine::default();
        let seen = Arc::new(AtomicUsize::new(0));

        // Kill lands while the driver still holds RUNNING.
        let ends = Arc::new(Mutex::new(Vec::new()));
        let task = engine.spawn::<Io>((0, seen.clone(), ends.clone())).unwrap();
        task.flags.store(STARTED | RUNNING, Ordering::Release);
        assert_eq!(engine.kill(&task), KillOutcome::Deferred);
        assert!(!engine.commit_finish(&task));
        engine.destroy_chain(task.clone());
        assert_eq!(task.state(), TaskState::Killed);
        assert_eq!(*ends.lock(), vec![TaskEnd::Killed]);

        // Finish committed first: the kill sees a dead task.
        let ends = Arc::new(Mutex::new(Vec::new()));
        let task = engine.spawn::<Io>((0, seen, ends.clone())).unwrap();
        task.flags.store(STARTED | RUNNING, Ordering::Release);
        assert!(engine.commit_finish(&task));
        assert_eq!(engine.kill(&task), KillOutcome::AlreadyDead);
        assert!(engine.destroy(&task, TaskEnd::Finished).is_none());
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(*ends.lock(), vec![TaskEnd::Finished]);
    }

    #[test]
    fn test_deferred_kill_never_ends_finished() {
        for _ in 0..500 {
            let engine = Arc::new(Engine::default());
            let seen = Arc::new(AtomicUsize::new(0));
            let ends = Arc::new(Mutex::new(Vec::new()));
            // Finishes on its first step.
            let task = engine.spawn::<Io>((0, seen, ends.clone())).unwrap();
            let go = Arc::new(Barrier::new(2));

            let driver = {
                let (engine, task, go) = (engine.clone(), task.clone(), go.clone());
                thread::spawn(move || {
                    go.wait();
                    let _ = engine.start(&task);
                })
            };
            go.wait();
            let outcome = engine.kill(&task);
            driver.join().unwrap();

            let ends = ends.lock();
            assert_eq!(ends.len(), 1, "destructor must run exactly once");
            if outcome != KillOutcome::AlreadyDead {
                assert_eq!(ends[0], TaskEnd::Killed, "{:?}", outcome);
            }
        }
    }

    struct Refuses;

    impl Machine for Refuses {
        type Param = u32;

        fn construct(n: u32) -> Result<Self, TaskError> {
            Err(TaskError::Construct(format!("no room for {}", n)))
        }

        fn step(&mut self, _cx: &mut StepCx<'_>) -> Step {
            Step::Finished
        }
    }

    #[test]
    fn test_construct_failure_is_reported() {
        let engine = Engine::default();
        let err = engine.run::<Refuses>(3).unwrap_err();
        assert_eq!(err, TaskError::Construct("no room for 3".into()));
        assert_eq!(engine.stats(), EngineStats::default());
    }

    /// Detects overlapping steps.
    struct Exclusive {
        in_step: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
        steps: Arc<AtomicUsize>,
        limit: usize,
    }

    impl Machine for Exclusive {
        type Param = (Arc<AtomicBool>, Arc<AtomicUsize>, Arc<AtomicUsize>, usize);

        fn construct((in_step, overlaps, steps, limit): Self::Param) -> Result<Self, TaskError> {
            Ok(Self { in_step, overlaps, steps, limit })
        }

        fn step(&mut self, cx: &mut StepCx<'_>) -> Step {
            if self.in_step.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            let n = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
            // Arm first so resumers race with the rest of this step.
            let done = n >= self.limit;
            if !done {
                cx.prepare_io();
            }
            for _ in 0..50 {
                std::hint::spin_loop();
            }
            self.in_step.store(false, Ordering::SeqCst);
            if done {
                Step::Finished
            } else {
                Step::YieldIo
            }
        }
    }

    #[test]
    fn test_concurrent_resumes_never_overlap_steps() {
        const LIMIT: usize = 5_000;
        const RESUMERS: usize = 8;

        let engine = Arc::new(Engine::new(EngineConfig {
            resume_spin_limit: 64,
            ..EngineConfig::default()
        }));
        let in_step = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let steps = Arc::new(AtomicUsize::new(0));
        let task = engine
            .run::<Exclusive>((in_step, overlaps.clone(), steps.clone(), LIMIT))
            .unwrap();

        let resumed = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..RESUMERS)
            .map(|_| {
                let (engine, task, resumed) = (engine.clone(), task.clone(), resumed.clone());
                thread::spawn(move || loop {
                    match engine.resume_io(task.clone(), IoResult::success(1, None)) {
                        Ok(()) => {
                            resumed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(TaskError::Destroyed) => break,
                        Err(_) => std::hint::spin_loop(),
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(steps.load(Ordering::SeqCst), LIMIT);
        assert_eq!(resumed.load(Ordering::SeqCst), LIMIT - 1);
        assert_eq!(task.state(), TaskState::Finished);
    }

    #[test]
    fn test_await_policy_from_str() {
        assert_eq!("PARK".parse(), Ok(AwaitRejectPolicy::Park));
        assert_eq!("kill".parse(), Ok(AwaitRejectPolicy::Kill));
        assert!("retry".parse::<AwaitRejectPolicy>().is_err());
    }
}
