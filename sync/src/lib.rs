//! Thread-safe handoff primitives shared across the toolkit.
//!
//! This crate provides the blocking queues that back the worker pool and
//! the connection pool, an atomic membership set used for lease tracking,
//! a condvar-based stop signal for monitor threads, and the idle-watermark
//! shrink heuristic shared by both elastic pools.

mod atomic_set;
mod blocking;
mod bounded;
mod priority;
mod stop;
mod watermark;

pub use atomic_set::AtomicSet;
pub use blocking::BlockingQueue;
pub use bounded::BoundedQueue;
pub use priority::{Priority, PriorityQueue};
pub use stop::StopSignal;
pub use watermark::IdleWatermark;
