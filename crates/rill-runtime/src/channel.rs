//! Typed channels for communication between tasks.
//!
//! # Channel Types
//!
//! - **Unbuffered (rendezvous)**, capacity 0: a send completes only when a
//!   receiver takes the value.
//! - **Buffered**, capacity C > 0: sends complete without a receiver until
//!   C values are pending.
//!
//! # Closing
//!
//! `close` is a one-way transition. Afterwards every send fails with
//! [`ChannelError::SendOnClosed`], buffered values are still drained in
//! order, and once the buffer is empty every receive reports closed.
//! A closed channel is never reopened; build a new one instead.
//!
//! # Example
//!
//! ```rust
//! use rill_runtime::{RuntimeConfig, Scheduler};
//!
//! let scheduler = Scheduler::new(RuntimeConfig::default());
//! let ch = scheduler.channel::<i32>(2);
//!
//! ch.send(1).unwrap();
//! ch.send(2).unwrap();
//! ch.close().unwrap();
//!
//! assert_eq!(ch.iter().collect::<Vec<_>>(), vec![1, 2]);
//! assert_eq!(ch.recv_ok(), (0, false));
//! ```

use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{Context, Selected};
use crate::error::{ChannelError, TryRecvError, TrySendError};
use crate::scheduler::Scheduler;
use crate::task::abandon;
use crate::waiters::{Packet, WaiterQueue};

/// Lock-protected channel state.
///
/// Invariants: `buffer.len() <= capacity`; `closed` never goes back to
/// false; once closed, `senders` is empty; receivers only park while the
/// buffer is empty.
pub(crate) struct State<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    closed: bool,
    pub(crate) senders: WaiterQueue<T>,
    pub(crate) receivers: WaiterQueue<T>,
}

impl<T> State<T> {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
            senders: WaiterQueue::new(),
            receivers: WaiterQueue::new(),
        }
    }

    /// Would a send complete (or fault) right now?
    pub(crate) fn send_ready(&self) -> bool {
        self.closed || self.receivers.has_live() || self.buffer.len() < self.capacity
    }

    /// Would a receive complete right now?
    pub(crate) fn recv_ready(&self) -> bool {
        !self.buffer.is_empty() || self.senders.has_live() || self.closed
    }

    pub(crate) fn try_send(&mut self, value: T) -> Result<(), TrySendError<T>> {
        if self.closed {
            return Err(TrySendError::Closed(value));
        }
        if let Some(receiver) = self.receivers.select_one() {
            receiver.packet.put(value);
            receiver.unpark();
            return Ok(());
        }
        if self.buffer.len() < self.capacity {
            self.buffer.push_back(value);
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }

    pub(crate) fn try_recv(&mut self) -> Result<T, TryRecvError> {
        if let Some(value) = self.buffer.pop_front() {
            self.refill();
            return Ok(value);
        }
        while let Some(sender) = self.senders.select_one() {
            let value = sender.packet.take();
            sender.unpark();
            if let Some(value) = value {
                return Ok(value);
            }
        }
        if self.closed {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Move parked senders' values into free buffer slots.
    fn refill(&mut self) {
        while self.buffer.len() < self.capacity {
            let Some(sender) = self.senders.select_one() else {
                break;
            };
            if let Some(value) = sender.packet.take() {
                self.buffer.push_back(value);
            }
            sender.unpark();
        }
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::DoubleClose);
        }
        self.closed = true;
        for receiver in self.receivers.select_all() {
            receiver.packet.close();
            receiver.unpark();
        }
        for sender in self.senders.select_all() {
            sender.packet.close();
            sender.unpark();
        }
        Ok(())
    }
}

pub(crate) type Shared<T> = Arc<Mutex<State<T>>>;

/// A typed channel, shared by every handle cloned from it.
///
/// Handles are cheap to clone; all clones refer to the same channel. The
/// channel lives as long as any handle does. Dropping handles never closes
/// it.
pub struct Channel<T> {
    shared: Shared<T>,
    scheduler: Scheduler,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Create a channel with room for `capacity` pending values
    /// (0 for a rendezvous channel).
    pub fn new(scheduler: &Scheduler, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(State::new(capacity))),
            scheduler: scheduler.clone(),
        }
    }

    /// Send a value, parking until it is buffered or taken by a receiver.
    ///
    /// # Errors
    ///
    /// [`ChannelError::SendOnClosed`] if the channel is closed, or gets
    /// closed while this send is parked. The value is dropped.
    pub fn send(&self, value: T) -> Result<(), ChannelError> {
        self.scheduler.checkpoint();
        let mut state = self.shared.lock();
        let value = match state.try_send(value) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(ChannelError::SendOnClosed),
            Err(TrySendError::Full(value)) => value,
        };

        let cx = Context::current(&self.scheduler);
        let packet = Packet::with_value(value);
        state.senders.register(&cx, 0, Arc::clone(&packet));
        drop(state);

        let sel = cx.wait();
        // The counterpart fills the packet while holding the lock.
        let mut state = self.shared.lock();
        match sel {
            Selected::Operation(_) if packet.delivered() => Ok(()),
            Selected::Operation(_) => Err(ChannelError::SendOnClosed),
            Selected::Waiting | Selected::Aborted => {
                state.senders.unregister(&cx);
                drop(state);
                abandon()
            }
        }
    }

    /// Send without parking.
    ///
    /// # Errors
    ///
    /// `Full(value)` if nobody is waiting and the buffer is full,
    /// `Closed(value)` if the channel is closed.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.scheduler.checkpoint();
        self.shared.lock().try_send(value)
    }

    /// Receive a value, parking until one arrives.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub fn recv(&self) -> Option<T> {
        self.scheduler.checkpoint();
        let mut state = self.shared.lock();
        match state.try_recv() {
            Ok(value) => return Some(value),
            Err(TryRecvError::Closed) => return None,
            Err(TryRecvError::Empty) => {}
        }

        let cx = Context::current(&self.scheduler);
        let packet = Packet::empty();
        state.receivers.register(&cx, 0, Arc::clone(&packet));
        drop(state);

        let sel = cx.wait();
        let mut state = self.shared.lock();
        match sel {
            Selected::Operation(_) => packet.received(),
            Selected::Waiting | Selected::Aborted => {
                state.receivers.unregister(&cx);
                drop(state);
                abandon()
            }
        }
    }

    /// Receive in comma-ok form: `(value, true)`, or `(T::default(), false)`
    /// once the channel is closed and drained.
    pub fn recv_ok(&self) -> (T, bool)
    where
        T: Default,
    {
        match self.recv() {
            Some(value) => (value, true),
            None => (T::default(), false),
        }
    }

    /// Receive without parking.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.scheduler.checkpoint();
        self.shared.lock().try_recv()
    }

    /// Close the channel.
    ///
    /// Releases every parked receiver with the closed result and every
    /// parked sender with `SendOnClosed`.
    ///
    /// # Errors
    ///
    /// [`ChannelError::DoubleClose`] if the channel was already closed.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.scheduler.checkpoint();
        self.shared.lock().close()
    }

    /// Iterate over received values until the channel is closed and
    /// drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            channel: self,
            done: false,
        }
    }
}

impl<T> Channel<T> {
    /// Check if the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.shared.lock().buffer.is_empty()
    }

    /// Buffer capacity; 0 for a rendezvous channel.
    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    /// Returns true if both handles refer to the same channel.
    pub fn same_channel(&self, other: &Channel<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn shared(&self) -> &Shared<T> {
        &self.shared
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Address used to order lock acquisition across channels.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.shared) as *const () as usize
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Channel")
            .field("capacity", &state.capacity)
            .field("len", &state.buffer.len())
            .field("closed", &state.closed)
            .field("parked_senders", &state.senders.len())
            .field("parked_receivers", &state.receivers.len())
            .finish()
    }
}

/// Borrowing iterator over a channel. See [`Channel::iter`].
///
/// Ends at the first closed result and stays ended.
pub struct Iter<'a, T> {
    channel: &'a Channel<T>,
    done: bool,
}

impl<T: Send + 'static> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.channel.recv();
        self.done = next.is_none();
        next
    }
}

impl<T: Send + 'static> FusedIterator for Iter<'_, T> {}

/// Owning iterator over a channel.
pub struct IntoIter<T> {
    channel: Channel<T>,
    done: bool,
}

impl<T: Send + 'static> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.channel.recv();
        self.done = next.is_none();
        next
    }
}

impl<T: Send + 'static> FusedIterator for IntoIter<T> {}

impl<T: Send + 'static> IntoIterator for Channel<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            channel: self,
            done: false,
        }
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
