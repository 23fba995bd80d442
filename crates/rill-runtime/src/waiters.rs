//! Waiter registry: the per-channel FIFO lists of parked senders and
//! receivers.
//!
//! A queue entry pairs a wait [`Context`] with the case index it stands for
//! and the [`Packet`] through which the value moves. All mutation happens
//! while the owning channel's lock is held.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{Context, Selected};

/// Hand-off slot between a parked waiter and its counterpart.
enum Slot<T> {
    /// Receiver: nothing delivered yet. Sender: value was taken.
    Empty,
    /// Receiver: value delivered. Sender: value still waiting to be taken.
    Value(T),
    /// Released by `close`.
    Closed,
}

pub(crate) struct Packet<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Packet<T> {
    /// A packet for a parked receiver.
    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::Empty),
        })
    }

    /// A packet for a parked sender, holding the value to deliver.
    pub(crate) fn with_value(value: T) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::Value(value)),
        })
    }

    /// Deliver a value to a parked receiver.
    pub(crate) fn put(&self, value: T) {
        *self.slot.lock() = Slot::Value(value);
    }

    /// Take the value a parked sender is holding.
    pub(crate) fn take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Value(value) => Some(value),
            Slot::Empty => None,
            Slot::Closed => {
                *slot = Slot::Closed;
                None
            }
        }
    }

    /// Release the waiter because the channel closed. Drops any value a
    /// sender was still holding.
    pub(crate) fn close(&self) {
        *self.slot.lock() = Slot::Closed;
    }

    /// Result for a receiver once selected: `None` means closed.
    pub(crate) fn received(&self) -> Option<T> {
        match std::mem::replace(&mut *self.slot.lock(), Slot::Closed) {
            Slot::Value(value) => Some(value),
            Slot::Empty | Slot::Closed => None,
        }
    }

    /// Result for a sender once selected: `false` means it was released by
    /// close instead of delivering.
    pub(crate) fn delivered(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Empty)
    }
}

/// One parked operation.
pub(crate) struct Waiter<T> {
    pub(crate) cx: Arc<Context>,
    pub(crate) case: usize,
    pub(crate) packet: Arc<Packet<T>>,
}

impl<T> Waiter<T> {
    /// Wake the waiter after its packet has been filled in.
    pub(crate) fn unpark(self) {
        self.cx.unpark();
    }
}

/// A FIFO queue of parked operations on one side of a channel.
pub(crate) struct WaiterQueue<T> {
    entries: VecDeque<Waiter<T>>,
}

impl<T> WaiterQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a parked operation at the back of the queue.
    pub(crate) fn register(&mut self, cx: &Arc<Context>, case: usize, packet: Arc<Packet<T>>) {
        self.entries.push_back(Waiter {
            cx: Arc::clone(cx),
            case,
            packet,
        });
    }

    /// Remove every entry belonging to `cx`.
    pub(crate) fn unregister(&mut self, cx: &Arc<Context>) {
        self.entries.retain(|entry| !Arc::ptr_eq(&entry.cx, cx));
    }

    /// Returns true if some entry can still be committed.
    pub(crate) fn has_live(&self) -> bool {
        self.entries.iter().any(|entry| entry.cx.is_waiting())
    }

    /// Commit the oldest entry that is still waiting and remove it.
    ///
    /// Entries whose context was already committed elsewhere (another case
    /// of the same select) are dropped on the way.
    pub(crate) fn select_one(&mut self) -> Option<Waiter<T>> {
        while let Some(entry) = self.entries.pop_front() {
            if entry.cx.try_select(Selected::Operation(entry.case)).is_ok() {
                return Some(entry);
            }
        }
        None
    }

    /// Commit and remove every entry that is still waiting.
    pub(crate) fn select_all(&mut self) -> Vec<Waiter<T>> {
        self.entries
            .drain(..)
            .filter(|entry| entry.cx.try_select(Selected::Operation(entry.case)).is_ok())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
