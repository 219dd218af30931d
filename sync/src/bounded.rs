//! Capacity-bounded blocking FIFO queue.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Blocking FIFO with a fixed capacity.
///
/// `put` blocks while the queue is full; `get` blocks while it is empty.
/// The timed variants honor their deadline and report failure instead of
/// blocking indefinitely.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue capacity must be non-zero");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until space is available, then append.
    pub fn put(&self, value: T) {
        let mut items = self.items.lock();
        while items.len() >= self.capacity {
            self.not_full.wait(&mut items);
        }
        items.push_back(value);
        self.not_empty.notify_one();
    }

    /// Append if space frees up within `timeout`; `false` on deadline.
    pub fn put_timeout(&self, value: T, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        while items.len() >= self.capacity {
            if self.not_full.wait_until(&mut items, deadline).timed_out()
                && items.len() >= self.capacity
            {
                return false;
            }
        }
        items.push_back(value);
        self.not_empty.notify_one();
        true
    }

    /// Append without blocking; `false` when full.
    pub fn try_put(&self, value: T) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(value);
        self.not_empty.notify_one();
        true
    }

    /// Block until an element is available.
    pub fn get(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(value) = items.pop_front() {
                self.not_full.notify_one();
                return value;
            }
            self.not_empty.wait(&mut items);
        }
    }

    /// Pop without blocking.
    pub fn try_get(&self) -> Option<T> {
        let mut items = self.items.lock();
        let value = items.pop_front();
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    /// Block up to `timeout`; `None` if the deadline passes with the
    /// queue still empty.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(value) = items.pop_front() {
                self.not_full.notify_one();
                return Some(value);
            }
            if self.not_empty.wait_until(&mut items, deadline).timed_out() {
                let value = items.pop_front();
                if value.is_some() {
                    self.not_full.notify_one();
                }
                return value;
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
        let mut items = self.items.lock();
        items.clear();
        self.not_full.notify_all();
    }
}
