//! Error types for the rill runtime.

use std::fmt;

use thiserror::Error;

/// Faults raised by channel operations.
///
/// Both variants are fatal to the task that triggers them: task bodies are
/// expected to propagate them with `?`, which ends the task with
/// [`TaskError::Channel`] while leaving every other task untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// A value was sent on a channel that is (or became) closed.
    #[error("send on closed channel")]
    SendOnClosed,

    /// `close` was called on a channel that was already closed.
    #[error("close of closed channel")]
    DoubleClose,
}

/// Error returned by [`Channel::try_send`](crate::Channel::try_send).
///
/// Carries the rejected value back to the caller.
#[derive(Clone, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No receiver is waiting and the buffer is full.
    Full(T),
    /// The channel is closed.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Extracts the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }

    /// Returns true if the send failed because the channel is full.
    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }

    /// Returns true if the send failed because the channel is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, TrySendError::Closed(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel is full"),
            TrySendError::Closed(_) => write!(f, "send on closed channel"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// Error returned by [`Channel::try_recv`](crate::Channel::try_recv).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// Nothing is buffered, no sender is parked, and the channel is open.
    #[error("channel is empty")]
    Empty,
    /// The channel is closed and drained.
    #[error("channel is closed")]
    Closed,
}

impl TryRecvError {
    /// Returns true if the channel was merely empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, TryRecvError::Empty)
    }

    /// Returns true if the channel is closed and drained.
    pub fn is_closed(&self) -> bool {
        matches!(self, TryRecvError::Closed)
    }
}

/// Reasons a task ended without completing its work normally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task propagated a channel fault.
    #[error("channel fault: {0}")]
    Channel(#[from] ChannelError),

    /// The task panicked during execution.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task returned an application error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The run ended before the task finished; it never ran further.
    #[error("task was abandoned")]
    Abandoned,

    /// The OS refused to create a thread for the task.
    #[error("failed to spawn task: {0}")]
    SpawnFailed(String),
}

impl From<String> for TaskError {
    fn from(msg: String) -> Self {
        TaskError::Failed(msg)
    }
}

impl From<&str> for TaskError {
    fn from(msg: &str) -> Self {
        TaskError::Failed(msg.to_string())
    }
}

/// Errors reported by [`Scheduler::run`](crate::Scheduler::run).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The scheduler already finished a run and accepts no new entry task.
    #[error("runtime has been shut down")]
    Shutdown,

    /// Every live task was blocked with nothing left to wake any of them.
    #[error("all tasks are asleep - deadlock")]
    Deadlock,

    /// The entry task ended in failure.
    #[error("entry task failed: {0}")]
    EntryFailed(#[from] TaskError),
}
