//! Elastic, priority-aware worker thread pool.
//!
//! N worker threads block on a three-class priority queue and run each
//! dequeued task to completion. A manager thread samples the pool every
//! [`ExecutorConfig::monitor_interval`]: it spawns workers (up to
//! `max_size`) when every worker is busy with work still queued, and
//! retires workers (down to `min_size`) once the idle watermark has held
//! for [`ExecutorConfig::max_idle`]. Submission returns a
//! [`TaskHandle`] immediately; tasks may submit further tasks.

mod handle;

pub use handle::{TaskError, TaskHandle};
pub use sync_queue::Priority;

use handle::panic_message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use sync_queue::{IdleWatermark, PriorityQueue, StopSignal};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sizing and cadence for an [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Workers kept alive even when idle.
    pub min_size: usize,
    /// Hard ceiling on concurrent workers.
    pub max_size: usize,
    /// How often the manager samples the pool.
    pub monitor_interval: Duration,
    /// How long an idle watermark must hold before workers retire.
    pub max_idle: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: thread::available_parallelism().map_or(4, |n| n.get()),
            monitor_interval: Duration::from_secs(5),
            max_idle: Duration::from_secs(600),
        }
    }
}

impl ExecutorConfig {
    /// Fixed worker bounds with default cadence.
    pub fn sized(min_size: usize, max_size: usize) -> Self {
        Self {
            min_size: min_size.min(max_size),
            max_size,
            ..Self::default()
        }
    }
}

struct Inner {
    min_size: AtomicUsize,
    max_size: AtomicUsize,
    monitor_interval: Duration,
    max_idle: Duration,
    queue: PriorityQueue<Job>,
    workers: Mutex<HashMap<ThreadId, JoinHandle<()>>>,
    closed: Mutex<Vec<JoinHandle<()>>>,
    worker_count: AtomicUsize,
    busy_count: AtomicUsize,
    // workers that should exit after their current task
    reduce_count: AtomicUsize,
    stop: AtomicBool,
    signal: StopSignal,
}

/// Elastic worker pool driving a priority task queue.
pub struct Executor {
    inner: Arc<Inner>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        let inner = Arc::new(Inner {
            min_size: AtomicUsize::new(config.min_size.min(config.max_size)),
            max_size: AtomicUsize::new(config.max_size),
            monitor_interval: config.monitor_interval,
            max_idle: config.max_idle,
            queue: PriorityQueue::new(),
            workers: Mutex::new(HashMap::new()),
            closed: Mutex::new(Vec::new()),
            worker_count: AtomicUsize::new(0),
            busy_count: AtomicUsize::new(0),
            reduce_count: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            signal: StopSignal::new(),
        });
        let executor = Self {
            inner,
            manager: Mutex::new(None),
        };
        executor.spawn_manager();
        executor
    }

    /// Restart a stopped pool; a no-op while running.
    pub fn start(&self) {
        if !self.inner.stop.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.signal.reset();
        self.spawn_manager();
    }

    /// Flag the pool to stop and wait for the manager to retire every
    /// worker. Queued tasks that no worker picked up resolve their
    /// handles as cancelled on drop.
    pub fn stop(&self) {
        if self.inner.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.signal.fire();
        if let Some(handle) = self.manager.lock().take() {
            let _ = handle.join();
        }
    }

    /// Queue `task` at `priority` and hand back its result handle.
    /// Submissions against a stopped pool resolve as cancelled.
    pub fn submit<F, R>(&self, priority: Priority, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.inner.stop.load(Ordering::Acquire) {
            return TaskHandle::new(rx);
        }
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            let _ = tx.send(result);
        });
        self.inner.queue.push(job, priority);
        TaskHandle::new(rx)
    }

    pub fn submit_high<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(Priority::High, task)
    }

    pub fn submit_normal<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(Priority::Normal, task)
    }

    pub fn submit_low<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(Priority::Low, task)
    }

    /// Current number of worker threads.
    pub fn len(&self) -> usize {
        self.inner.worker_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Workers currently executing a task.
    pub fn busy(&self) -> usize {
        self.inner.busy_count.load(Ordering::Acquire)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Lower the floor; ignored if it would exceed the ceiling.
    pub fn set_min_size(&self, size: usize) {
        if size <= self.inner.max_size.load(Ordering::Acquire) {
            self.inner.min_size.store(size, Ordering::Release);
        }
    }

    /// Raise or lower the ceiling; ignored if it would drop below the
    /// floor.
    pub fn set_max_size(&self, size: usize) {
        if size >= self.inner.min_size.load(Ordering::Acquire) {
            self.inner.max_size.store(size, Ordering::Release);
        }
    }

    /// Grow the ceiling by `extra` workers.
    pub fn add_capacity(&self, extra: usize) {
        self.inner.max_size.fetch_add(extra, Ordering::AcqRel);
    }

    fn spawn_manager(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("executor-manager".to_string())
            .spawn(move || manager_proc(&inner))
            .expect("failed to spawn executor manager");
        *self.manager.lock() = Some(handle);
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn min(&self) -> usize {
        self.min_size.load(Ordering::Acquire)
    }

    fn max(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    fn add_workers(self: &Arc<Self>, count: usize) {
        let mut workers = self.workers.lock();
        for _ in 0..count {
            let inner = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name("executor-worker".to_string())
                .spawn(move || worker_proc(&inner));
            match spawned {
                Ok(handle) => {
                    workers.insert(handle.thread().id(), handle);
                    self.worker_count.fetch_add(1, Ordering::AcqRel);
                }
                Err(e) => tracing::warn!("failed to spawn worker: {e}"),
            }
        }
    }

    fn wake_workers(&self, count: usize) {
        for _ in 0..count {
            self.queue.push(Box::new(|| {}), Priority::Normal);
        }
    }

    // move our own join handle where the manager can reap it
    fn retire_current(&self) {
        let id = thread::current().id();
        let handle = self.workers.lock().remove(&id);
        if let Some(handle) = handle {
            self.closed.lock().push(handle);
        }
    }

    fn join_closed(&self) {
        let closed = std::mem::take(&mut *self.closed.lock());
        for handle in closed {
            let _ = handle.join();
        }
    }

    fn check_scale(self: &Arc<Self>, watermark: &mut IdleWatermark) {
        let workers = self.worker_count.load(Ordering::Acquire);
        let busy = self.busy_count.load(Ordering::Acquire);
        let idle = workers.saturating_sub(busy);

        let reclaim = watermark
            .observe(idle)
            .min(workers.saturating_sub(self.min()));
        if reclaim > 0 {
            tracing::debug!(reclaim, workers, "retiring idle workers");
            self.reduce_count.fetch_add(reclaim, Ordering::AcqRel);
            self.wake_workers(reclaim);
        }

        let queued = self.queue.len();
        if queued > 0 && busy == workers {
            let max = self.max();
            if workers < max {
                let grow = (max - workers).min(queued);
                tracing::debug!(grow, workers, queued, "growing worker pool");
                self.add_workers(grow);
            } else {
                tracing::warn!(workers, queued, "worker pool at full load");
            }
        }
    }

    fn join_all(&self) {
        self.wake_workers(self.max().max(self.worker_count.load(Ordering::Acquire)));
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut workers = self.workers.lock();
                workers.drain().map(|(_, handle)| handle).collect()
            };
            let closed = std::mem::take(&mut *self.closed.lock());
            if drained.is_empty() && closed.is_empty() {
                break;
            }
            for handle in drained.into_iter().chain(closed) {
                let _ = handle.join();
            }
        }
        self.worker_count.store(0, Ordering::Release);
        self.busy_count.store(0, Ordering::Release);
        self.reduce_count.store(0, Ordering::Release);
        // abandoned jobs resolve their handles as cancelled on drop
        self.queue.clear();
    }
}

fn worker_proc(inner: &Inner) {
    while !inner.stop.load(Ordering::Acquire) {
        let job = inner.queue.pop();
        inner.busy_count.fetch_add(1, Ordering::AcqRel);
        job();
        let retire = inner
            .reduce_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        inner.busy_count.fetch_sub(1, Ordering::AcqRel);
        if retire {
            break;
        }
    }
    inner.retire_current();
    inner.worker_count.fetch_sub(1, Ordering::AcqRel);
}

fn manager_proc(inner: &Arc<Inner>) {
    inner.add_workers(inner.min());
    let mut watermark = IdleWatermark::new(inner.monitor_interval, inner.max_idle);

    while !inner.signal.wait_for(inner.monitor_interval) {
        inner.check_scale(&mut watermark);
        inner.join_closed();
    }
    inner.join_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn small_pool(min: usize, max: usize) -> Executor {
        Executor::new(ExecutorConfig {
            min_size: min,
            max_size: max,
            monitor_interval: Duration::from_millis(20),
            max_idle: Duration::from_millis(100),
        })
    }

    #[test]
    fn task_result_is_delivered() {
        let pool = small_pool(1, 2);
        let handle = pool.submit_normal(|| 2 + 2);
        assert_eq!(handle.wait().unwrap(), 4);
        pool.stop();
    }

    #[test]
    fn panics_are_captured() {
        let pool = small_pool(1, 2);
        let handle = pool.submit_normal(|| panic!("boom"));
        match handle.wait() {
            Err(TaskError::Panicked(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected result: {other:?}"),
        }
        // the worker survives the panic
        let handle = pool.submit_normal(|| "still alive");
        assert_eq!(handle.wait().unwrap(), "still alive");
        pool.stop();
    }

    #[test]
    fn high_runs_before_normal() {
        // fill the single worker with a blocked LOW task, queue HIGH and
        // NORMAL behind it, then release: completion order must be
        // LOW, HIGH, NORMAL.
        let pool = small_pool(1, 1);
        let (order_tx, order_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let tx = order_tx.clone();
        let low = pool.submit_low(move || {
            release_rx.recv().unwrap();
            tx.send("low").unwrap();
        });
        // let the worker pick up the LOW task before queueing the rest
        std::thread::sleep(Duration::from_millis(50));

        let tx = order_tx.clone();
        let normal = pool.submit_normal(move || tx.send("normal").unwrap());
        let tx = order_tx.clone();
        let high = pool.submit_high(move || tx.send("high").unwrap());

        release_tx.send(()).unwrap();
        low.wait().unwrap();
        high.wait().unwrap();
        normal.wait().unwrap();

        let order: Vec<_> = order_rx.try_iter().collect();
        assert_eq!(order, vec!["low", "high", "normal"]);
        pool.stop();
    }

    #[test]
    fn grows_to_max_under_load() {
        let pool = small_pool(1, 4);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Arc::new(Mutex::new(release_rx));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let release_rx = release_rx.clone();
                pool.submit_normal(move || {
                    let guard = release_rx.lock();
                    guard.recv().unwrap();
                })
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.len() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.len(), 4, "pool should grow to max under load");

        for _ in 0..4 {
            release_tx.send(()).unwrap();
        }
        for handle in handles {
            handle.wait().unwrap();
        }
        pool.stop();
    }

    #[test]
    fn shrinks_back_to_min_when_idle() {
        let pool = small_pool(1, 4);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Arc::new(Mutex::new(release_rx));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let release_rx = release_rx.clone();
                pool.submit_normal(move || {
                    let guard = release_rx.lock();
                    guard.recv().unwrap();
                })
            })
            .collect();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.len() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        for _ in 0..4 {
            release_tx.send(()).unwrap();
        }
        for handle in handles {
            handle.wait().unwrap();
        }

        // idle long past max_idle; the watermark retires the extras
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.len() > 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(pool.len(), 1, "pool should shrink to min, never below");
        pool.stop();
    }

    #[test]
    fn stop_then_start_runs_again() {
        let pool = small_pool(1, 2);
        assert_eq!(pool.submit_normal(|| 1).wait().unwrap(), 1);
        pool.stop();
        assert_eq!(pool.len(), 0);

        pool.start();
        assert_eq!(pool.submit_normal(|| 2).wait().unwrap(), 2);
        pool.stop();
    }

    #[test]
    fn submit_after_stop_is_cancelled() {
        let pool = small_pool(1, 2);
        pool.stop();
        let handle = pool.submit_normal(|| 1);
        assert!(matches!(handle.wait(), Err(TaskError::Cancelled)));
    }

    #[test]
    fn tasks_can_submit_tasks() {
        let pool = std::sync::Arc::new(small_pool(1, 4));
        let chained = pool.clone();
        let handle = pool.submit_normal(move || chained.submit_high(|| 7).wait().unwrap());
        assert_eq!(handle.wait().unwrap(), 7);
        pool.stop();
    }

    #[test]
    fn busy_count_tracks_execution() {
        let pool = small_pool(2, 2);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Arc::new(Mutex::new(release_rx));
        let blocker = {
            let release_rx = release_rx.clone();
            pool.submit_normal(move || release_rx.lock().recv().unwrap())
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.busy() < 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.busy(), 1);
        release_tx.send(()).unwrap();
        blocker.wait().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.busy() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.busy(), 0);
        pool.stop();
    }
}
