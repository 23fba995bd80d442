//! Task identity, lifecycle state and handles.
//!
//! This module provides:
//! - `TaskId` - Unique identifier for tasks
//! - `TaskState` - Lifecycle state of a task
//! - `TaskHandle` - Handle for observing and joining a spawned task
//! - `TaskOutcome` - What a task body may return

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::TaskError;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Generate a new unique task ID.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// State of a task.
///
/// A task is `Runnable` while it waits for an execution slot and `Running`
/// while it holds one. `Blocked` tasks hold no slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Ready to run, queued for an execution slot.
    Runnable,
    /// Executing on an execution slot.
    Running,
    /// Parked on a channel operation or select.
    Blocked,
    /// Finished, failed, or abandoned.
    Done,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Runnable,
            1 => TaskState::Running,
            2 => TaskState::Blocked,
            _ => TaskState::Done,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TaskState::Runnable => 0,
            TaskState::Running => 1,
            TaskState::Blocked => 2,
            TaskState::Done => 3,
        }
    }
}

/// Values a task body may return.
///
/// Returning `Err` ends the task in failure, which is how channel faults
/// abort a task: `ch.send(v)?` inside the body.
pub trait TaskOutcome {
    /// Convert into the task's result slot value.
    fn into_result(self) -> Result<(), TaskError>;
}

impl TaskOutcome for () {
    fn into_result(self) -> Result<(), TaskError> {
        Ok(())
    }
}

impl<E> TaskOutcome for Result<(), E>
where
    E: Into<TaskError>,
{
    fn into_result(self) -> Result<(), TaskError> {
        self.map_err(Into::into)
    }
}

/// The boxed continuation a task runs.
pub(crate) type Work = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

/// Unwind payload used to abandon a task once the run has ended.
pub(crate) struct Abandoned;

/// Unwind out of the current task without running the panic hook.
pub(crate) fn abandon() -> ! {
    std::panic::resume_unwind(Box::new(Abandoned))
}

/// Render a panic payload the way it was raised.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Shared per-task record.
///
/// `state` is only written while the scheduler lock is held; handles read
/// it without locking.
pub(crate) struct TaskCell {
    id: TaskId,
    name: String,
    state: AtomicU8,
    /// Signalled under the scheduler lock when the task is granted a slot
    /// or the run terminates.
    pub(crate) wakeup: Condvar,
    result: Mutex<Option<Result<(), TaskError>>>,
    finished: Condvar,
}

impl TaskCell {
    pub(crate) fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            name,
            state: AtomicU8::new(TaskState::Runnable.as_u8()),
            wakeup: Condvar::new(),
            result: Mutex::new(None),
            finished: Condvar::new(),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Store the final result and release joiners.
    pub(crate) fn complete(&self, result: Result<(), TaskError>) {
        *self.result.lock() = Some(result);
        self.finished.notify_all();
    }

    fn wait(&self) -> Result<(), TaskError> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.finished.wait(&mut result);
        }
    }

    fn try_result(&self) -> Option<Result<(), TaskError>> {
        self.result.lock().clone()
    }
}

/// A handle to a spawned task.
///
/// Spawning is fire-and-forget; the handle may simply be dropped. It is
/// cheap to clone.
///
/// # Example
///
/// ```rust
/// use rill_runtime::{RuntimeConfig, Scheduler, TaskState};
///
/// let scheduler = Scheduler::new(RuntimeConfig::default());
/// let handle = scheduler.spawn(|| {});
/// assert_eq!(handle.join(), Ok(()));
/// assert_eq!(handle.state(), TaskState::Done);
/// ```
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self { cell }
    }

    /// Get the task's unique identifier.
    pub fn id(&self) -> TaskId {
        self.cell.id()
    }

    /// Get the task's name.
    pub fn name(&self) -> &str {
        self.cell.name()
    }

    /// Get the current state of the task.
    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    /// Check if the task has finished.
    pub fn is_finished(&self) -> bool {
        self.cell.try_result().is_some()
    }

    /// Block the calling thread until the task is done and return its result.
    ///
    /// This parks the OS thread without giving up an execution slot, so it
    /// is meant for callers outside the runtime. Tasks should coordinate
    /// through channels instead.
    pub fn join(&self) -> Result<(), TaskError> {
        self.cell.wait()
    }

    /// Get the result without blocking, if the task is done.
    pub fn try_join(&self) -> Option<Result<(), TaskError>> {
        self.cell.try_result()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
