//! Per-operation wait context.
//!
//! Every blocking send, receive or select creates one `Context` and
//! registers it with the waiter queues of the channels involved. The
//! `select` word is the single commit point of the operation: whoever
//! moves it out of `Waiting` first owns the wakeup, every later attempt
//! fails and the stale registration is skipped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use crate::scheduler::Scheduler;
use crate::task::TaskCell;

/// Outcome of a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selected {
    /// Still waiting for a counterpart.
    Waiting,
    /// Given up by the waiter itself (the run ended).
    Aborted,
    /// Case `n` of the operation was completed by a counterpart or by close.
    Operation(usize),
}

impl From<usize> for Selected {
    fn from(raw: usize) -> Self {
        match raw {
            0 => Selected::Waiting,
            1 => Selected::Aborted,
            n => Selected::Operation(n - 2),
        }
    }
}

impl From<Selected> for usize {
    fn from(sel: Selected) -> Self {
        match sel {
            Selected::Waiting => 0,
            Selected::Aborted => 1,
            Selected::Operation(n) => n + 2,
        }
    }
}

/// How the waiter gets parked and woken.
enum Parker {
    /// A runtime task; parking releases its execution slot.
    Task { scheduler: Scheduler, cell: Arc<TaskCell> },
    /// A plain OS thread outside the runtime.
    Thread(Thread),
}

pub(crate) struct Context {
    select: AtomicUsize,
    parker: Parker,
}

impl Context {
    /// Create a context for the calling task, or the calling thread when it
    /// is not one of `scheduler`'s tasks.
    pub(crate) fn current(scheduler: &Scheduler) -> Arc<Self> {
        let parker = match scheduler.current_task() {
            Some(cell) => Parker::Task {
                scheduler: scheduler.clone(),
                cell,
            },
            None => Parker::Thread(thread::current()),
        };
        Arc::new(Self {
            select: AtomicUsize::new(Selected::Waiting.into()),
            parker,
        })
    }

    /// Try selecting an operation.
    ///
    /// On failure, the previously selected operation is returned.
    #[inline]
    pub(crate) fn try_select(&self, sel: Selected) -> Result<(), Selected> {
        self.select
            .compare_exchange(
                Selected::Waiting.into(),
                sel.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(Selected::from)
    }

    #[inline]
    pub(crate) fn selected(&self) -> Selected {
        Selected::from(self.select.load(Ordering::Acquire))
    }

    /// Returns true while nobody has committed this context yet.
    #[inline]
    pub(crate) fn is_waiting(&self) -> bool {
        self.selected() == Selected::Waiting
    }

    /// Wake the waiter. Must follow a successful `try_select`.
    pub(crate) fn unpark(&self) {
        match &self.parker {
            Parker::Task { scheduler, cell } => scheduler.wake(cell),
            Parker::Thread(thread) => thread.unpark(),
        }
    }

    /// Park until some counterpart selects this context.
    ///
    /// Returns `Selected::Aborted` when the run ended while parked; the
    /// caller is then expected to clean up its registrations and abandon
    /// the task.
    pub(crate) fn wait(&self) -> Selected {
        match &self.parker {
            Parker::Task { scheduler, cell } => {
                if scheduler.park(cell, || !self.is_waiting()).is_ok() {
                    return self.selected();
                }
                // The run is over. Whether or not a counterpart raced us,
                // the task must not continue.
                let _ = self.try_select(Selected::Aborted);
                Selected::Aborted
            }
            Parker::Thread(_) => loop {
                let sel = self.selected();
                if sel != Selected::Waiting {
                    return sel;
                }
                thread::park();
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;

    #[test]
    fn test_selected_encoding() {
        for sel in [
            Selected::Waiting,
            Selected::Aborted,
            Selected::Operation(0),
            Selected::Operation(9),
        ] {
            let raw: usize = sel.into();
            assert_eq!(Selected::from(raw), sel);
        }
    }

    #[test]
    fn test_first_writer_wins() {
        let scheduler = Scheduler::new(RuntimeConfig::default());
        let cx = Context::current(&scheduler);
        assert!(cx.is_waiting());

        assert_eq!(cx.try_select(Selected::Operation(1)), Ok(()));
        assert_eq!(
            cx.try_select(Selected::Operation(0)),
            Err(Selected::Operation(1))
        );
        assert_eq!(cx.selected(), Selected::Operation(1));
    }

    #[test]
    fn test_thread_waiter_woken_from_other_thread() {
        let scheduler = Scheduler::new(RuntimeConfig::default());
        let cx = Context::current(&scheduler);

        let waker = {
            let cx = Arc::clone(&cx);
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(10));
                cx.try_select(Selected::Operation(3)).unwrap();
                cx.unpark();
            })
        };

        assert_eq!(cx.wait(), Selected::Operation(3));
        waker.join().unwrap();
    }
}
