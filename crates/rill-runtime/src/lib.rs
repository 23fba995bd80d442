//! Rill Runtime - lightweight tasks that communicate over channels
//!
//! This crate provides:
//! - `Scheduler` - Owns the tasks of a run and the execution slots they share
//! - `TaskHandle` - Handle for observing a spawned task
//! - `Channel<T>` - Typed rendezvous or buffered channels with close
//! - `Select` - Wait on several channel operations, commit to one
//!
//! # Design
//!
//! - Thread-per-task, with at most `workers` tasks running at once
//! - Blocked tasks give up their execution slot
//! - Per-channel FIFO service for parked senders and receivers
//! - Uniform random choice among ready select cases
//! - No global state: every channel and select holds its `Scheduler`
//!
//! # Example
//!
//! ```rust
//! use rill_runtime::{RuntimeConfig, Scheduler};
//!
//! let scheduler = Scheduler::new(RuntimeConfig::new().with_workers(2));
//! let results = scheduler.channel::<bool>(0);
//!
//! let result = scheduler.run({
//!     let scheduler = scheduler.clone();
//!     move || {
//!         for i in 0..4 {
//!             let tx = results.clone();
//!             scheduler.spawn(move || tx.send(i % 2 == 0));
//!         }
//!         let evens = (0..4).filter(|_| results.recv() == Some(true)).count();
//!         assert_eq!(evens, 2);
//!     }
//! });
//! assert!(result.is_ok());
//! ```

pub mod channel;
mod context;
pub mod error;
pub mod scheduler;
pub mod select;
pub mod task;
mod waiters;

pub use channel::{Channel, IntoIter, Iter};
pub use error::{ChannelError, RuntimeError, TaskError, TryRecvError, TrySendError};
pub use scheduler::{run_process, Scheduler, SchedulerStats};
pub use select::Select;
pub use task::{TaskHandle, TaskId, TaskOutcome, TaskState};

use std::str::FromStr;

/// Configuration for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name prefix for task threads
    pub thread_name_prefix: String,
    /// Stack size for task threads (bytes)
    pub stack_size: Option<usize>,
    /// Maximum number of tasks running at once
    pub workers: usize,
    /// Seed for the select random source; `None` seeds from the OS
    pub seed: Option<u64>,
    /// End the run with `RuntimeError::Deadlock` when every task is blocked
    pub detect_deadlock: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "rill-task".to_string(),
            stack_size: None,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            seed: None,
            detect_deadlock: true,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default settings overlaid with `RILL_WORKERS`, `RILL_SEED`,
    /// `RILL_STACK_SIZE` and `RILL_DETECT_DEADLOCK`.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        self.workers = env_get(&lookup, "RILL_WORKERS").unwrap_or(self.workers);
        self.seed = env_get(&lookup, "RILL_SEED").or(self.seed);
        self.stack_size = env_get(&lookup, "RILL_STACK_SIZE").or(self.stack_size);
        self.detect_deadlock = env_get_bool(&lookup, "RILL_DETECT_DEADLOCK", self.detect_deadlock);
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the stack size for task threads.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set the number of execution slots (at least 1).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Seed the select random source for reproducible choices.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Enable or disable deadlock detection.
    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.detect_deadlock = enabled;
        self
    }
}

fn env_get<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

/// Accepts "1", "true", "yes", "on" as true and "0", "false", "no", "off"
/// as false; anything else keeps the default.
fn env_get_bool(lookup: impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
