//! Bounded FIFO queue with timed asynchronous pop.

use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

/// Queue contents, guarded by a single lock.
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded queue of idle resources.
///
/// Pushing never waits: a full or closed queue hands the item back to the caller.
/// Popping waits up to a timeout for an item to appear.
pub(crate) struct IdleQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> IdleQueue<T> {
    /// Create an empty queue holding at most `capacity` items.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an item.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue is full or closed.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.state.lock();
            if state.closed || state.items.len() >= self.capacity {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the oldest item without waiting.
    pub(crate) fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Take the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout, or immediately if the queue is closed and empty.
    pub(crate) async fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Close the queue, waking all waiters. Returns items that were still queued.
    pub(crate) fn close(&self) -> Vec<T> {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.notify.notify_waiters();
        drained
    }

    /// Current number of queued items.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.state.lock().items.len() >= self.capacity
    }
}
