//! Interruptible stop signal for monitor threads.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-way latch a monitor thread sleeps against.
///
/// `wait_for` sleeps for a full tick unless `fire` interrupts it, so a
/// stopping component never waits out a multi-second monitor interval.
pub struct StopSignal {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            fired: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Latch the signal and wake every sleeper.
    pub fn fire(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.cv.notify_all();
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.lock()
    }

    /// Reset a fired signal so the owner can be restarted.
    pub fn reset(&self) {
        *self.fired.lock() = false;
    }

    /// Sleep up to `tick`. Returns `true` when the signal fired.
    pub fn wait_for(&self, tick: Duration) -> bool {
        let deadline = Instant::now() + tick;
        let mut fired = self.fired.lock();
        while !*fired {
            if self.cv.wait_until(&mut fired, deadline).timed_out() {
                return *fired;
            }
        }
        true
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
