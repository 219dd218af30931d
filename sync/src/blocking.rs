//! Unbounded blocking FIFO queue.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Thread-safe FIFO handoff with no capacity bound.
///
/// `put` never blocks; `get` blocks until an element is available.
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Append an element and wake one blocked consumer.
    pub fn put(&self, value: T) {
        let mut items = self.items.lock();
        items.push_back(value);
        self.ready.notify_one();
    }

    /// Append every element of `values`, waking a consumer per element.
    pub fn put_all<I: IntoIterator<Item = T>>(&self, values: I) {
        let mut items = self.items.lock();
        for value in values {
            items.push_back(value);
            self.ready.notify_one();
        }
    }

    /// Block until an element is available.
    pub fn get(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(value) = items.pop_front() {
                return value;
            }
            self.ready.wait(&mut items);
        }
    }

    /// Pop without blocking.
    pub fn try_get(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Block up to `timeout`; `None` if the deadline passes with the
    /// queue still empty.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(value) = items.pop_front() {
                return Some(value);
            }
            if self.ready.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
