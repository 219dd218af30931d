//! Three-class priority FIFO queue.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Scheduling class for queued work.
///
/// Classes drain strictly in `High`, `Normal`, `Low` order; within a
/// class, elements are FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

struct Lanes<T> {
    high: VecDeque<T>,
    normal: VecDeque<T>,
    low: VecDeque<T>,
    // cached so len() never walks the three lists
    len: usize,
}

impl<T> Lanes<T> {
    fn pop_highest(&mut self) -> Option<T> {
        let value = self
            .high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front());
        if value.is_some() {
            self.len -= 1;
        }
        value
    }
}

/// Blocking queue with three priority classes.
pub struct PriorityQueue<T> {
    lanes: Mutex<Lanes<T>>,
    ready: Condvar,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
                len: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Append to the lane for `priority` and wake one blocked consumer.
    pub fn push(&self, value: T, priority: Priority) {
        let mut lanes = self.lanes.lock();
        match priority {
            Priority::High => lanes.high.push_back(value),
            Priority::Normal => lanes.normal.push_back(value),
            Priority::Low => lanes.low.push_back(value),
        }
        lanes.len += 1;
        self.ready.notify_one();
    }

    /// Block until an element is available, draining High before Normal
    /// before Low.
    pub fn pop(&self) -> T {
        let mut lanes = self.lanes.lock();
        loop {
            if let Some(value) = lanes.pop_highest() {
                return value;
            }
            self.ready.wait(&mut lanes);
        }
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.lanes.lock().pop_highest()
    }

    /// Block up to `timeout`; `None` if the deadline passes with the
    /// queue still empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut lanes = self.lanes.lock();
        loop {
            if let Some(value) = lanes.pop_highest() {
                return Some(value);
            }
            if self.ready.wait_until(&mut lanes, deadline).timed_out() {
                return lanes.pop_highest();
            }
        }
    }

    /// Total queued elements across all classes.
    pub fn len(&self) -> usize {
        self.lanes.lock().len
    }

    /// Queued elements in one class.
    pub fn len_of(&self, priority: Priority) -> usize {
        let lanes = self.lanes.lock();
        match priority {
            Priority::High => lanes.high.len(),
            Priority::Normal => lanes.normal.len(),
            Priority::Low => lanes.low.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.lock().len == 0
    }

    pub fn clear(&self) {
        let mut lanes = self.lanes.lock();
        lanes.high.clear();
        lanes.normal.clear();
        lanes.low.clear();
        lanes.len = 0;
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn drains_high_before_normal_before_low() {
        let queue = PriorityQueue::new();
        queue.push("low", Priority::Low);
        queue.push("normal", Priority::Normal);
        queue.push("high", Priority::High);
        assert_eq!(queue.pop(), "high");
        assert_eq!(queue.pop(), "normal");
        assert_eq!(queue.pop(), "low");
    }

    #[test]
    fn fifo_within_class() {
        let queue = PriorityQueue::new();
        queue.push(1, Priority::Normal);
        queue.push(2, Priority::Normal);
        queue.push(3, Priority::Normal);
        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.pop(), 2);
        assert_eq!(queue.pop(), 3);
    }

    #[test]
    fn len_is_sum_of_lanes() {
        let queue = PriorityQueue::new();
        queue.push(1, Priority::High);
        queue.push(2, Priority::Normal);
        queue.push(3, Priority::Normal);
        queue.push(4, Priority::Low);
        assert_eq!(queue.len(), 4);
        assert_eq!(
            queue.len(),
            queue.len_of(Priority::High)
                + queue.len_of(Priority::Normal)
                + queue.len_of(Priority::Low)
        );
        queue.pop();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.len_of(Priority::High), 0);
    }

    #[test]
    fn pop_timeout_expires() {
        let queue: PriorityQueue<u32> = PriorityQueue::new();
        assert_eq!(queue.pop_timeout(Duration::from_millis(30)), None);
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(PriorityQueue::new());
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(42, Priority::Low);
        });
        assert_eq!(queue.pop(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn try_pop_empty() {
        let queue: PriorityQueue<u32> = PriorityQueue::new();
        assert_eq!(queue.try_pop(), None);
    }
}
