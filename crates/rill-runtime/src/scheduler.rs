//! The task scheduler.
//!
//! Every task gets its own OS thread at spawn time, but a task only makes
//! progress while it holds one of `workers` execution slots. A task gives
//! its slot back whenever it parks on a channel operation (or yields) and
//! has to queue for a slot again once woken. Slots are handed out in FIFO
//! order from the ready queue.
//!
//! # Run semantics
//!
//! [`Scheduler::run`] spawns the entry task and returns as soon as it
//! exits. Every other task is abandoned at that moment: queued tasks never
//! start, parked tasks are released and unwound, running tasks are unwound
//! at their next channel operation, select or yield.
//!
//! ```rust
//! use rill_runtime::{RuntimeConfig, Scheduler};
//!
//! let scheduler = Scheduler::new(RuntimeConfig::default());
//! let done = scheduler.channel::<u32>(0);
//!
//! let result = scheduler.run({
//!     let scheduler = scheduler.clone();
//!     move || -> Result<(), rill_runtime::ChannelError> {
//!         let tx = done.clone();
//!         scheduler.spawn(move || tx.send(7));
//!         assert_eq!(done.recv(), Some(7));
//!         Ok(())
//!     }
//! });
//! assert!(result.is_ok());
//! ```

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, trace, warn};

use crate::channel::Channel;
use crate::error::{RuntimeError, TaskError};
use crate::task::{
    abandon, panic_message, Abandoned, TaskCell, TaskHandle, TaskId, TaskOutcome, TaskState,
    Work,
};
use crate::RuntimeConfig;

/// Why a run ended.
#[derive(Debug, Clone)]
enum Termination {
    /// The entry task finished with this result.
    EntryExited(Result<(), TaskError>),
    /// Every live task was blocked.
    Deadlock,
}

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    /// Tasks spawned and not yet done.
    pub live: usize,
    /// Tasks holding an execution slot.
    pub running: usize,
    /// Tasks parked on a channel operation.
    pub blocked: usize,
    /// Total tasks ever spawned.
    pub spawned: u64,
    /// Total tasks that reached `Done`.
    pub completed: u64,
}

struct State {
    tasks: HashMap<TaskId, Arc<TaskCell>>,
    /// Maps a task's OS thread back to its record.
    threads: HashMap<ThreadId, Arc<TaskCell>>,
    /// Runnable tasks waiting for a slot. May hold stale entries, which
    /// `dispatch` skips.
    ready: VecDeque<Arc<TaskCell>>,
    running: usize,
    blocked: usize,
    run_started: bool,
    entry: Option<TaskId>,
    termination: Option<Termination>,
    spawned: u64,
    completed: u64,
}

struct Inner {
    config: RuntimeConfig,
    workers: usize,
    state: Mutex<State>,
    /// Signalled when the run terminates.
    terminated: Condvar,
    /// Set once with `State::termination`; read without the lock.
    ended: AtomicBool,
    rng: Mutex<StdRng>,
}

/// Owns the live tasks and the execution slots they share.
///
/// Cloning a `Scheduler` yields another handle to the same scheduler. All
/// channels and selects hold one; there is no global scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler with the given configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        let workers = config.workers.max(1);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            inner: Arc::new(Inner {
                config,
                workers,
                state: Mutex::new(State {
                    tasks: HashMap::new(),
                    threads: HashMap::new(),
                    ready: VecDeque::new(),
                    running: 0,
                    blocked: 0,
                    run_started: false,
                    entry: None,
                    termination: None,
                    spawned: 0,
                    completed: 0,
                }),
                terminated: Condvar::new(),
                ended: AtomicBool::new(false),
                rng: Mutex::new(rng),
            }),
        }
    }

    /// Get the configuration this scheduler was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Number of execution slots.
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Create a channel bound to this scheduler.
    pub fn channel<T: Send + 'static>(&self, capacity: usize) -> Channel<T> {
        Channel::new(self, capacity)
    }

    /// Spawn a new task.
    ///
    /// Returns immediately; the task is queued for an execution slot. If
    /// the run already ended, the task is never started and its handle
    /// reports [`TaskError::Abandoned`].
    pub fn spawn<F, O>(&self, work: F) -> TaskHandle
    where
        F: FnOnce() -> O + Send + 'static,
        O: TaskOutcome,
    {
        self.spawn_named("task", work)
    }

    /// Spawn a new task with a name used in logs and as its thread name.
    pub fn spawn_named<F, O>(&self, name: impl Into<String>, work: F) -> TaskHandle
    where
        F: FnOnce() -> O + Send + 'static,
        O: TaskOutcome,
    {
        self.spawn_inner(name.into(), Box::new(move || work().into_result()), false)
    }

    fn spawn_inner(&self, name: String, work: Work, is_entry: bool) -> TaskHandle {
        let cell = TaskCell::new(name);
        let handle = TaskHandle::new(Arc::clone(&cell));

        {
            let mut st = self.inner.state.lock();
            if st.termination.is_some() {
                drop(st);
                debug!(task = %cell.id(), "spawn after run ended, task abandoned");
                cell.set_state(TaskState::Done);
                cell.complete(Err(TaskError::Abandoned));
                return handle;
            }
            st.tasks.insert(cell.id(), Arc::clone(&cell));
            if is_entry {
                st.entry = Some(cell.id());
            }
            st.spawned += 1;
            st.ready.push_back(Arc::clone(&cell));
            self.dispatch(&mut st);
        }

        let mut builder = thread::Builder::new().name(format!(
            "{}-{}",
            self.inner.config.thread_name_prefix,
            cell.id().as_u64()
        ));
        if let Some(stack_size) = self.inner.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let scheduler = self.clone();
        let task = Arc::clone(&cell);
        match builder.spawn(move || scheduler.run_task(task, work)) {
            Ok(_detached) => {
                debug!(task = %cell.id(), name = cell.name(), entry = is_entry, "task spawned");
            }
            Err(err) => {
                warn!(task = %cell.id(), %err, "failed to create task thread");
                self.finish(&cell, None, Err(TaskError::SpawnFailed(err.to_string())));
            }
        }

        handle
    }

    /// Body of every task thread.
    fn run_task(&self, cell: Arc<TaskCell>, work: Work) {
        let thread_id = thread::current().id();
        {
            let mut st = self.inner.state.lock();
            st.threads.insert(thread_id, Arc::clone(&cell));
            if self.wait_for_slot(&mut st, &cell).is_err() {
                drop(st);
                self.finish(&cell, Some(thread_id), Err(TaskError::Abandoned));
                return;
            }
        }

        trace!(task = %cell.id(), "task started");
        let result = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(result) => result,
            Err(payload) if payload.is::<Abandoned>() => Err(TaskError::Abandoned),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        };
        self.finish(&cell, Some(thread_id), result);
    }

    /// Wait on the task's condvar until it holds a slot.
    fn wait_for_slot(
        &self,
        st: &mut MutexGuard<'_, State>,
        cell: &TaskCell,
    ) -> Result<(), Abandoned> {
        loop {
            if st.termination.is_some() {
                return Err(Abandoned);
            }
            if cell.state() == TaskState::Running {
                return Ok(());
            }
            cell.wakeup.wait(st);
        }
    }

    /// Hand free slots to the oldest runnable tasks.
    fn dispatch(&self, st: &mut State) {
        if st.termination.is_some() {
            return;
        }
        while st.running < self.inner.workers {
            let Some(cell) = st.ready.pop_front() else {
                break;
            };
            if cell.state() != TaskState::Runnable {
                continue;
            }
            cell.set_state(TaskState::Running);
            st.running += 1;
            trace!(task = %cell.id(), "slot granted");
            cell.wakeup.notify_one();
        }
    }

    /// Park the calling task until `ready` holds.
    ///
    /// `ready` is evaluated under the scheduler lock, and every waker flips
    /// it before calling [`Scheduler::wake`], so a wakeup that lands before
    /// the task gets here is never lost.
    pub(crate) fn park(&self, cell: &TaskCell, ready: impl Fn() -> bool) -> Result<(), Abandoned> {
        let mut st = self.inner.state.lock();
        if st.termination.is_some() {
            return Err(Abandoned);
        }
        if ready() {
            return Ok(());
        }

        if cell.state() == TaskState::Running {
            st.running -= 1;
        }
        cell.set_state(TaskState::Blocked);
        st.blocked += 1;
        trace!(task = %cell.id(), "task parked");

        self.dispatch(&mut st);
        self.check_deadlock(&mut st);
        self.wait_for_slot(&mut st, cell)
    }

    /// Make a parked task runnable again.
    pub(crate) fn wake(&self, cell: &Arc<TaskCell>) {
        let mut st = self.inner.state.lock();
        if cell.state() != TaskState::Blocked {
            // Not parked yet; `park` will notice the committed context.
            return;
        }
        cell.set_state(TaskState::Runnable);
        st.blocked -= 1;
        st.ready.push_back(Arc::clone(cell));
        trace!(task = %cell.id(), "task woken");
        self.dispatch(&mut st);
    }

    /// Give up the execution slot and queue behind every other runnable
    /// task. Outside the runtime this is a plain OS-level yield.
    pub fn yield_now(&self) {
        let Some(cell) = self.current_task() else {
            thread::yield_now();
            return;
        };

        let mut st = self.inner.state.lock();
        if st.termination.is_some() {
            drop(st);
            abandon();
        }
        if st.ready.is_empty() {
            return;
        }

        if cell.state() == TaskState::Running {
            st.running -= 1;
        }
        cell.set_state(TaskState::Runnable);
        st.ready.push_back(Arc::clone(&cell));
        self.dispatch(&mut st);
        if self.wait_for_slot(&mut st, &cell).is_err() {
            drop(st);
            abandon();
        }
    }

    /// Record a task's final result.
    fn finish(
        &self,
        cell: &Arc<TaskCell>,
        thread_id: Option<ThreadId>,
        result: Result<(), TaskError>,
    ) {
        let mut st = self.inner.state.lock();
        match cell.state() {
            TaskState::Running => st.running -= 1,
            TaskState::Blocked => st.blocked -= 1,
            TaskState::Runnable | TaskState::Done => {}
        }
        cell.set_state(TaskState::Done);
        st.tasks.remove(&cell.id());
        if let Some(thread_id) = thread_id {
            st.threads.remove(&thread_id);
        }
        st.completed += 1;

        if st.entry == Some(cell.id()) && st.termination.is_none() {
            debug!(
                task = %cell.id(),
                ok = result.is_ok(),
                abandoned = st.tasks.len(),
                "entry task exited"
            );
            self.terminate(&mut st, Termination::EntryExited(result.clone()));
        } else {
            self.dispatch(&mut st);
            self.check_deadlock(&mut st);
        }
        drop(st);

        match &result {
            Ok(()) => debug!(task = %cell.id(), "task completed"),
            Err(TaskError::Abandoned) => trace!(task = %cell.id(), "task abandoned"),
            Err(err) => warn!(task = %cell.id(), name = cell.name(), %err, "task failed"),
        }
        cell.complete(result);
    }

    fn terminate(&self, st: &mut State, cause: Termination) {
        st.termination = Some(cause);
        self.inner.ended.store(true, Ordering::Release);
        for cell in st.tasks.values() {
            cell.wakeup.notify_all();
        }
        self.inner.terminated.notify_all();
    }

    fn check_deadlock(&self, st: &mut State) {
        if !self.inner.config.detect_deadlock || st.entry.is_none() || st.termination.is_some() {
            return;
        }
        if !st.tasks.is_empty() && st.blocked == st.tasks.len() {
            error!(blocked = st.blocked, "all tasks are asleep - deadlock");
            self.terminate(st, Termination::Deadlock);
        }
    }

    /// Run `entry` as the entry task and wait for it to exit.
    ///
    /// When the entry task exits, normally or by failure, the run is over
    /// and every other task is abandoned. A scheduler runs at most once.
    pub fn run<F, O>(&self, entry: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() -> O + Send + 'static,
        O: TaskOutcome,
    {
        {
            let mut st = self.inner.state.lock();
            if st.run_started {
                return Err(RuntimeError::Shutdown);
            }
            st.run_started = true;
        }

        debug!(workers = self.inner.workers, "run starting");
        self.spawn_inner("main".to_string(), Box::new(move || entry().into_result()), true);

        let mut st = self.inner.state.lock();
        let cause = loop {
            if let Some(cause) = st.termination.clone() {
                break cause;
            }
            self.inner.terminated.wait(&mut st);
        };
        drop(st);

        debug!(?cause, "run finished");
        match cause {
            Termination::EntryExited(Ok(())) => Ok(()),
            Termination::EntryExited(Err(err)) => Err(RuntimeError::EntryFailed(err)),
            Termination::Deadlock => Err(RuntimeError::Deadlock),
        }
    }

    /// Returns true once a run has ended.
    pub fn is_terminated(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Unwind the calling task if the run has ended.
    ///
    /// Every channel operation and select passes through here, so a task
    /// that holds a slot when the run ends stops at its next one. Threads
    /// outside the runtime are never unwound.
    pub(crate) fn checkpoint(&self) {
        if self.is_terminated() && self.current_task().is_some() {
            abandon();
        }
    }

    /// Number of tasks spawned and not yet done.
    pub fn live_tasks(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Snapshot of the scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        let st = self.inner.state.lock();
        SchedulerStats {
            live: st.tasks.len(),
            running: st.running,
            blocked: st.blocked,
            spawned: st.spawned,
            completed: st.completed,
        }
    }

    /// The calling thread's task record, if it is one of ours.
    pub(crate) fn current_task(&self) -> Option<Arc<TaskCell>> {
        self.inner
            .state
            .lock()
            .threads
            .get(&thread::current().id())
            .cloned()
    }

    /// Borrow the scheduler's random source.
    pub(crate) fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.inner.rng.lock())
    }

    pub(crate) fn same_as(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.inner.workers)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Run `entry` on a fresh scheduler and exit the process when it exits.
///
/// `entry` receives a handle to the scheduler so it can spawn tasks and
/// create channels. Exit status is 0 when the entry task succeeds and 2
/// when it fails or the run deadlocks. Other tasks get no chance to finish.
pub fn run_process<F, O>(config: RuntimeConfig, entry: F) -> !
where
    F: FnOnce(Scheduler) -> O + Send + 'static,
    O: TaskOutcome,
{
    let scheduler = Scheduler::new(config);
    let handle = scheduler.clone();
    let code = match scheduler.run(move || entry(handle)) {
        Ok(()) => 0,
        Err(err) => {
            error!(%err, "run failed");
            eprintln!("fatal error: {}", err);
            2
        }
    };
    std::process::exit(code)
}
