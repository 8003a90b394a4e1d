//! Hand-off queue between transport callbacks and the pulling thread.
//!
//! Any number of producer threads may [`enqueue`](MessageQueue::enqueue)
//! concurrently; a single consumer blocks in
//! [`dequeue`](MessageQueue::dequeue). [`shutdown`](MessageQueue::shutdown)
//! wakes the consumer, destroys whatever is still queued and makes every
//! later call return [`QueueClosed`]. Delivery is strictly FIFO.

use std::{collections::VecDeque, sync::PoisonError};
#[cfg(not(loom))]
use std::sync::{Condvar, Mutex, MutexGuard};

use log::debug;
#[cfg(loom)]
use loom::sync::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::metrics;


/// Returned once the queue has been shut down.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("message queue closed")]
pub struct QueueClosed;

struct QueueState<M> {
    items: VecDeque<M>,
    closed: bool,
}

/// Unbounded multi-producer, single-consumer queue with explicit shutdown.
pub struct MessageQueue<M> {
    state: Mutex<QueueState<M>>,
    available: Condvar,
}

impl<M> Default for MessageQueue<M> {
    fn default() -> Self { Self::new() }
}

impl<M> MessageQueue<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    // A panicking producer cannot leave the deque half-updated, so the
    // poisoned state is still consistent.
    fn lock(&self) -> MutexGuard<'_, QueueState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `message` without blocking on the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] after [`shutdown`](Self::shutdown); the
    /// message is destroyed.
    pub fn enqueue(&self, message: M) -> Result<(), QueueClosed> {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            drop(message);
            metrics::add_dropped(1);
            debug!("message dropped: queue closed");
            return Err(QueueClosed);
        }
        state.items.push_back(message);
        let depth = state.items.len();
        drop(state);
        self.available.notify_one();
        metrics::set_queue_depth(depth);
        Ok(())
    }

    /// Block until a message is available.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if the queue is, or becomes, shut down.
    pub fn dequeue(&self) -> Result<M, QueueClosed> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(QueueClosed);
            }
            if let Some(message) = state.items.pop_front() {
                metrics::set_queue_depth(state.items.len());
                return Ok(message);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take the next message if one is queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] after shutdown.
    pub fn try_dequeue(&self) -> Result<Option<M>, QueueClosed> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueClosed);
        }
        let message = state.items.pop_front();
        metrics::set_queue_depth(state.items.len());
        Ok(message)
    }

    /// Close the queue, wake all waiters and destroy queued messages.
    ///
    /// Returns how many messages were destroyed. Calling it again is a
    /// no-op returning zero.
    pub fn shutdown(&self) -> usize {
        let mut state = self.lock();
        let already_closed = state.closed;
        state.closed = true;
        let drained = std::mem::take(&mut state.items);
        drop(state);
        self.available.notify_all();

        let count = drained.len();
        drop(drained);
        if !already_closed {
            metrics::add_dropped(count);
            metrics::set_queue_depth(0);
            debug!("message queue shut down: drained={count}");
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize { self.lock().items.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.lock().items.is_empty() }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.lock().closed }
}
