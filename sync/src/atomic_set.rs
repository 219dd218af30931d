//! Mutex-guarded unordered membership set.

use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::Hash;

/// Thread-safe unordered set.
///
/// Every operation takes the internal lock for a constant-time map
/// touch, so callers on different threads never block each other for
/// long. Used for busy-lease tracking where neither side may stall.
pub struct AtomicSet<T: Eq + Hash> {
    items: Mutex<HashSet<T, RandomState>>,
}

impl<T: Eq + Hash> AtomicSet<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashSet::default()),
        }
    }

    /// `true` if the value was newly inserted.
    pub fn insert(&self, value: T) -> bool {
        self.items.lock().insert(value)
    }

    /// `true` if the value was present and removed.
    pub fn remove(&self, value: &T) -> bool {
        self.items.lock().remove(value)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items.lock().contains(value)
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

impl<T: Eq + Hash> Default for AtomicSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
