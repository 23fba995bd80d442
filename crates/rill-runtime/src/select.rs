//! # Select over Channel Operations
//!
//! [`Select`] waits on several send and receive operations at once and
//! commits to exactly one of them.
//!
//! 1. Every distinct channel in the set is locked, in address order, for
//!    the whole evaluation.
//! 2. One of the ready cases is drawn uniformly at random, performed and
//!    its continuation run. The other cases have no effect.
//! 3. If nothing is ready, the default runs when there is one.
//! 4. Otherwise the caller registers on every channel and parks; the first
//!    counterpart to commit the shared wait context completes that case.
//!
//! A send case on a closed channel counts as ready and then faults with
//! [`ChannelError::SendOnClosed`].
//!
//! ## Example
//!
//! ```rust
//! use rill_runtime::{RuntimeConfig, Scheduler, Select};
//!
//! let scheduler = Scheduler::new(RuntimeConfig::default());
//! let numbers = scheduler.channel::<i32>(1);
//! let words = scheduler.channel::<&'static str>(1);
//! numbers.send(42).unwrap();
//!
//! let got = Select::new(&scheduler)
//!     .recv(&numbers, |n| format!("number {:?}", n))
//!     .recv(&words, |w| format!("word {:?}", w))
//!     .wait()
//!     .unwrap();
//! assert_eq!(got, "number Some(42)");
//!
//! let idle = Select::new(&scheduler)
//!     .recv(&words, |_| false)
//!     .default(|| true)
//!     .wait()
//!     .unwrap();
//! assert!(idle);
//! ```

use std::any::Any;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use rand::{Rng, RngCore};
use tracing::trace;

use crate::channel::{Channel, State};
use crate::context::{Context, Selected};
use crate::error::{ChannelError, TryRecvError, TrySendError};
use crate::scheduler::Scheduler;
use crate::task::abandon;
use crate::waiters::Packet;

type Guard<T> = ArcMutexGuard<RawMutex, State<T>>;

/// Locks held over every distinct channel of one select, sorted by key.
struct Locks {
    guards: Vec<(usize, Box<dyn Any>)>,
}

impl Locks {
    fn acquire<R>(cases: &[Box<dyn Case<R> + '_>]) -> Self {
        let mut order: Vec<&dyn Case<R>> = cases.iter().map(|case| &**case).collect();
        order.sort_by_key(|case| case.key());
        order.dedup_by_key(|case| case.key());
        Self {
            guards: order.iter().map(|case| (case.key(), case.lock())).collect(),
        }
    }

    fn state<T: 'static>(&mut self, key: usize) -> &mut State<T> {
        let guard = self
            .guards
            .iter_mut()
            .find(|(k, _)| *k == key)
            .and_then(|(_, guard)| guard.downcast_mut::<Guard<T>>());
        match guard {
            Some(guard) => &mut **guard,
            None => unreachable!("channel {:#x} is not locked by this select", key),
        }
    }
}

/// One operation of a select, with its element type erased.
trait Case<R> {
    fn key(&self) -> usize;
    fn lock(&self) -> Box<dyn Any>;
    fn is_ready(&self, locks: &mut Locks) -> bool;
    /// Perform the operation without parking. Returns false if it turned
    /// out not to be ready after all.
    fn try_complete(&mut self, locks: &mut Locks) -> bool;
    fn register(&mut self, locks: &mut Locks, cx: &Arc<Context>, index: usize);
    fn unregister(&self, locks: &mut Locks, cx: &Arc<Context>);
    /// Collect the result left by the counterpart that selected us.
    fn complete_parked(&mut self);
    fn run(self: Box<Self>) -> Result<R, ChannelError>;
}

struct RecvCase<T, F> {
    channel: Channel<T>,
    body: F,
    packet: Option<Arc<Packet<T>>>,
    outcome: Option<Option<T>>,
}

impl<T, F, R> Case<R> for RecvCase<T, F>
where
    T: Send + 'static,
    F: FnOnce(Option<T>) -> R,
{
    fn key(&self) -> usize {
        self.channel.key()
    }

    fn lock(&self) -> Box<dyn Any> {
        Box::new(self.channel.shared().lock_arc())
    }

    fn is_ready(&self, locks: &mut Locks) -> bool {
        locks.state::<T>(self.key()).recv_ready()
    }

    fn try_complete(&mut self, locks: &mut Locks) -> bool {
        match locks.state::<T>(self.key()).try_recv() {
            Ok(value) => self.outcome = Some(Some(value)),
            Err(TryRecvError::Closed) => self.outcome = Some(None),
            Err(TryRecvError::Empty) => return false,
        }
        true
    }

    fn register(&mut self, locks: &mut Locks, cx: &Arc<Context>, index: usize) {
        let packet = Packet::empty();
        locks
            .state::<T>(self.key())
            .receivers
            .register(cx, index, Arc::clone(&packet));
        self.packet = Some(packet);
    }

    fn unregister(&self, locks: &mut Locks, cx: &Arc<Context>) {
        locks.state::<T>(self.key()).receivers.unregister(cx);
    }

    fn complete_parked(&mut self) {
        self.outcome = Some(self.packet.take().and_then(|packet| packet.received()));
    }

    fn run(self: Box<Self>) -> Result<R, ChannelError> {
        let this = *self;
        Ok((this.body)(this.outcome.flatten()))
    }
}

struct SendCase<T, F> {
    channel: Channel<T>,
    value: Option<T>,
    body: F,
    packet: Option<Arc<Packet<T>>>,
    delivered: bool,
}

impl<T, F, R> Case<R> for SendCase<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> R,
{
    fn key(&self) -> usize {
        self.channel.key()
    }

    fn lock(&self) -> Box<dyn Any> {
        Box::new(self.channel.shared().lock_arc())
    }

    fn is_ready(&self, locks: &mut Locks) -> bool {
        locks.state::<T>(self.key()).send_ready()
    }

    fn try_complete(&mut self, locks: &mut Locks) -> bool {
        let Some(value) = self.value.take() else {
            return false;
        };
        match locks.state::<T>(self.key()).try_send(value) {
            Ok(()) => self.delivered = true,
            Err(TrySendError::Closed(_)) => self.delivered = false,
            Err(TrySendError::Full(value)) => {
                self.value = Some(value);
                return false;
            }
        }
        true
    }

    fn register(&mut self, locks: &mut Locks, cx: &Arc<Context>, index: usize) {
        let Some(value) = self.value.take() else {
            return;
        };
        let packet = Packet::with_value(value);
        locks
            .state::<T>(self.key())
            .senders
            .register(cx, index, Arc::clone(&packet));
        self.packet = Some(packet);
    }

    fn unregister(&self, locks: &mut Locks, cx: &Arc<Context>) {
        locks.state::<T>(self.key()).senders.unregister(cx);
    }

    fn complete_parked(&mut self) {
        self.delivered = self
            .packet
            .take()
            .is_some_and(|packet| packet.delivered());
    }

    fn run(self: Box<Self>) -> Result<R, ChannelError> {
        let this = *self;
        if this.delivered {
            Ok((this.body)())
        } else {
            Err(ChannelError::SendOnClosed)
        }
    }
}

/// A one-shot select over channel operations.
///
/// Cases are added with [`recv`](Select::recv) and [`send`](Select::send);
/// [`wait`](Select::wait) evaluates them once. All continuations produce
/// the same result type `R`.
pub struct Select<'a, R> {
    scheduler: Scheduler,
    cases: Vec<Box<dyn Case<R> + 'a>>,
    default: Option<Box<dyn FnOnce() -> R + 'a>>,
    rng: Option<&'a mut dyn RngCore>,
}

impl<'a, R> Select<'a, R> {
    /// Create an empty select on `scheduler`.
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            cases: Vec::new(),
            default: None,
            rng: None,
        }
    }

    /// Add a receive case. `body` gets `Some(value)`, or `None` if the
    /// channel is closed and drained.
    pub fn recv<T, F>(mut self, channel: &Channel<T>, body: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce(Option<T>) -> R + 'a,
    {
        debug_assert!(channel.scheduler().same_as(&self.scheduler));
        self.cases.push(Box::new(RecvCase {
            channel: channel.clone(),
            body,
            packet: None,
            outcome: None,
        }));
        self
    }

    /// Add a send case for `value`. `body` runs once the value was taken.
    pub fn send<T, F>(mut self, channel: &Channel<T>, value: T, body: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce() -> R + 'a,
    {
        debug_assert!(channel.scheduler().same_as(&self.scheduler));
        self.cases.push(Box::new(SendCase {
            channel: channel.clone(),
            value: Some(value),
            body,
            packet: None,
            delivered: false,
        }));
        self
    }

    /// Set the branch taken when no case is ready. Replaces any earlier one.
    pub fn default<F>(mut self, body: F) -> Self
    where
        F: FnOnce() -> R + 'a,
    {
        self.default = Some(Box::new(body));
        self
    }

    /// Draw among ready cases with `rng` instead of the scheduler's source.
    pub fn rng(mut self, rng: &'a mut dyn RngCore) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Number of cases, not counting the default.
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Returns true if no case was added.
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Evaluate the select, parking if no case is ready and there is no
    /// default.
    ///
    /// Returns the chosen continuation's result. With no cases and no
    /// default this never returns.
    ///
    /// # Errors
    ///
    /// [`ChannelError::SendOnClosed`] when the chosen case is a send on a
    /// closed channel.
    pub fn wait(mut self) -> Result<R, ChannelError> {
        self.scheduler.checkpoint();
        let mut locks = Locks::acquire(&self.cases);

        loop {
            let ready: Vec<usize> = (0..self.cases.len())
                .filter(|&i| self.cases[i].is_ready(&mut locks))
                .collect();
            if ready.is_empty() {
                break;
            }
            let pick = ready[self.draw(ready.len())];
            // A stale parked counterpart can make a case look ready; try
            // again with whatever is still ready once it is skipped.
            if self.cases[pick].try_complete(&mut locks) {
                drop(locks);
                trace!(case = pick, ready = ready.len(), "select case ready");
                return self.cases.swap_remove(pick).run();
            }
        }

        if let Some(default) = self.default.take() {
            drop(locks);
            trace!("select default taken");
            return Ok(default());
        }

        let cx = Context::current(&self.scheduler);
        for (index, case) in self.cases.iter_mut().enumerate() {
            case.register(&mut locks, &cx, index);
        }
        drop(locks);

        let sel = cx.wait();

        // Counterparts fill packets while holding the channel lock.
        let mut locks = Locks::acquire(&self.cases);
        for case in &self.cases {
            case.unregister(&mut locks, &cx);
        }
        match sel {
            Selected::Operation(index) if index < self.cases.len() => {
                self.cases[index].complete_parked();
                drop(locks);
                trace!(case = index, "select woken");
                self.cases.swap_remove(index).run()
            }
            _ => {
                drop(locks);
                abandon()
            }
        }
    }

    fn draw(&mut self, n: usize) -> usize {
        if n == 1 {
            return 0;
        }
        match self.rng.as_mut() {
            Some(rng) => rng.gen_range(0..n),
            None => self.scheduler.with_rng(|rng| rng.gen_range(0..n)),
        }
    }
}

impl<R> std::fmt::Debug for Select<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Select")
            .field("cases", &self.cases.len())
            .field("default", &self.default.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::thread;
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::new(RuntimeConfig::default())
    }

    #[test]
    fn test_select_ready_recv() {
        let scheduler = scheduler();
        let a = scheduler.channel::<i32>(1);
        let b = scheduler.channel::<i32>(1);
        b.send(7).unwrap();

        let got = Select::new(&scheduler)
            .recv(&a, |v| ("a", v))
            .recv(&b, |v| ("b", v))
            .wait();
        assert_eq!(got, Ok(("b", Some(7))));
        assert!(b.is_empty());
    }

    #[test]
    fn test_select_fairness() {
        let scheduler = scheduler();
        let a = scheduler.channel::<u8>(1);
        let b = scheduler.channel::<u8>(1);
        let mut counts = [0usize; 2];

        for _ in 0..2000 {
            a.send(0).unwrap();
            b.send(1).unwrap();
            let first = Select::new(&scheduler)
                .recv(&a, |v| v)
                .recv(&b, |v| v)
                .wait()
                .unwrap()
                .unwrap();
            counts[first as usize] += 1;
            // Drain the case that lost.
            let (_, ok) = if first == 0 { b.recv_ok() } else { a.recv_ok() };
            assert!(ok);
        }

        assert!(counts[0] > 800, "counts: {:?}", counts);
        assert!(counts[1] > 800, "counts: {:?}", counts);
    }

    #[test]
    fn test_select_seeded_choices_are_reproducible() {
        fn choices(seed: u64) -> Vec<u8> {
            let scheduler = Scheduler::new(RuntimeConfig::new().with_seed(seed));
            let a = scheduler.channel::<u8>(1);
            let b = scheduler.channel::<u8>(1);
            (0..64)
                .map(|_| {
                    let _ = a.try_send(0);
                    let _ = b.try_send(1);
                    Select::new(&scheduler)
                        .recv(&a, |v| v)
                        .recv(&b, |v| v)
                        .wait()
                        .unwrap()
                        .unwrap()
                })
                .collect()
        }

        assert_eq!(choices(99), choices(99));
    }

    #[test]
    fn test_select_injected_rng() {
        let scheduler = scheduler();
        let a = scheduler.channel::<u8>(64);
        let b = scheduler.channel::<u8>(64);

        let run = |seed: u64| -> Vec<u8> {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..32)
                .map(|_| {
                    let _ = a.try_send(0);
                    let _ = b.try_send(1);
                    Select::new(&scheduler)
                        .recv(&a, |v| v)
                        .recv(&b, |v| v)
                        .rng(&mut rng)
                        .wait()
                        .unwrap()
                        .unwrap()
                })
                .collect()
        };

        let first = run(5);
        while a.try_recv().is_ok() {}
        while b.try_recv().is_ok() {}
        assert_eq!(first, run(5));
    }

    #[test]
    fn test_select_default_when_nothing_ready() {
        let scheduler = scheduler();
        let ch = scheduler.channel::<i32>(0);

        let select = Select::new(&scheduler)
            .recv(&ch, |_| "recv")
            .default(|| "default");
        assert_eq!(select.len(), 1);
        assert!(!select.is_empty());
        assert_eq!(select.wait(), Ok("default"));
    }

    #[test]
    fn test_select_without_cases_is_empty() {
        let scheduler = scheduler();
        let select = Select::new(&scheduler).default(|| 0);
        assert!(select.is_empty());
        assert_eq!(select.len(), 0);
        assert_eq!(select.wait(), Ok(0));
    }

    #[test]
    fn test_select_send_case() {
        let scheduler = scheduler();
        let ch = scheduler.channel::<i32>(1);

        let sent = Select::new(&scheduler)
            .send(&ch, 5, || true)
            .default(|| false)
            .wait();
        assert_eq!(sent, Ok(true));
        assert_eq!(ch.recv(), Some(5));

        // Buffer full again: the default runs and the value is not sent.
        ch.send(6).unwrap();
        let sent = Select::new(&scheduler)
            .send(&ch, 7, || true)
            .default(|| false)
            .wait();
        assert_eq!(sent, Ok(false));
        assert_eq!(ch.len(), 1);
    }

    #[test]
    fn test_select_send_on_closed_faults() {
        let scheduler = scheduler();
        let ch = scheduler.channel::<i32>(1);
        ch.close().unwrap();

        let result = Select::new(&scheduler)
            .send(&ch, 1, || ())
            .default(|| ())
            .wait();
        assert_eq!(result, Err(ChannelError::SendOnClosed));
    }

    #[test]
    fn test_select_closed_channel_yields_none() {
        let scheduler = scheduler();
        let ch = scheduler.channel::<i32>(0);

        let closer = {
            let ch = ch.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ch.close().unwrap();
            })
        };

        let got = Select::new(&scheduler).recv(&ch, |v| v).wait();
        assert_eq!(got, Ok(None));
        closer.join().unwrap();
    }

    #[test]
    fn test_blocking_select_woken_by_sender() {
        let scheduler = scheduler();
        let a = scheduler.channel::<i32>(0);
        let b = scheduler.channel::<String>(0);

        let sender = {
            let b = b.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                b.send("hello".to_string())
            })
        };

        let got = Select::new(&scheduler)
            .recv(&a, |v| format!("a: {:?}", v))
            .recv(&b, |v| format!("b: {:?}", v))
            .wait();
        assert_eq!(got, Ok("b: Some(\"hello\")".to_string()));
        assert_eq!(sender.join().unwrap(), Ok(()));

        // No stale registration is left on the channel that lost.
        assert_eq!(a.try_send(1), Err(TrySendError::Full(1)));
    }

    #[test]
    fn test_blocking_select_send_taken_by_receiver() {
        let scheduler = scheduler();
        let out = scheduler.channel::<i32>(0);
        let never = scheduler.channel::<i32>(0);

        let receiver = {
            let out = out.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                out.recv()
            })
        };

        let got = Select::new(&scheduler)
            .send(&out, 11, || "sent")
            .recv(&never, |_| "received")
            .wait();
        assert_eq!(got, Ok("sent"));
        assert_eq!(receiver.join().unwrap(), Some(11));
    }

    #[test]
    fn test_select_same_channel_twice() {
        let scheduler = scheduler();
        let ch = scheduler.channel::<i32>(2);
        ch.send(1).unwrap();

        let got = Select::new(&scheduler)
            .recv(&ch, |v| v)
            .recv(&ch, |v| v)
            .wait();
        assert_eq!(got, Ok(Some(1)));
    }

    #[test]
    fn test_competing_selects_each_commit_once() {
        let scheduler = scheduler();
        let ch = scheduler.channel::<i32>(0);
        let other = scheduler.channel::<i32>(0);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                let ch = ch.clone();
                let other = other.clone();
                thread::spawn(move || {
                    Select::new(&scheduler)
                        .recv(&ch, |v| v)
                        .recv(&other, |v| v)
                        .wait()
                        .unwrap()
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        for i in 0..4 {
            ch.send(i).unwrap();
        }

        let mut got: Vec<i32> = waiters
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }
}
