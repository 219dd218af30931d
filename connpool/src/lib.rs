//! Self-healing leased-connection pool.
//!
//! [`ConnPool`] owns a set of opaque connections between `min` and `max`
//! in size. Idle connections sit in a blocking queue; leased ones are
//! tracked in an atomic id set so acquire/release never block the
//! monitor thread and vice versa. Acquire health-checks every handed-out
//! connection and silently discards dead ones; a monitor thread shrinks
//! the pool along the idle watermark, replenishes it toward `min` and
//! for waiting acquirers, and probes idle connections for silent death.
//!
//! Leases release on drop, so a connection can never leak out of the
//! accounting.

mod conn_str;

pub use conn_str::ConnStr;

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sync_queue::{AtomicSet, BlockingQueue, IdleWatermark, StopSignal};

/// The narrow contract a pooled connection must satisfy. Everything
/// else (queries, transactions, result sets) is a consumer concern.
pub trait Connection: Send + 'static {
    /// Hand the connection its (opaque) connection string.
    fn set_info(&mut self, info: &str);
    /// Establish the connection; `false` on failure.
    fn connect(&mut self) -> bool;
    /// Tear the connection down.
    fn close(&mut self);
    /// `true` while the connection is alive.
    fn ping(&mut self) -> bool;
}

/// Sizing and cadence for a [`ConnPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections kept open even when idle.
    pub min_size: usize,
    /// Hard ceiling on open connections.
    pub max_size: usize,
    /// How often the monitor samples the pool.
    pub monitor_interval: Duration,
    /// How long an idle watermark must hold before connections close.
    pub max_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: thread::available_parallelism().map_or(4, |n| n.get()),
            monitor_interval: Duration::from_secs(30),
            max_idle: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    /// Fixed capacity bounds with default cadence.
    pub fn sized(min_size: usize, max_size: usize) -> Self {
        Self {
            min_size: min_size.min(max_size),
            max_size,
            ..Self::default()
        }
    }
}

struct Slot<C> {
    id: u64,
    conn: C,
}

struct Inner<C: Connection> {
    conn_str: String,
    min_size: AtomicUsize,
    max_size: AtomicUsize,
    count: AtomicUsize,
    waiting: AtomicUsize,
    idle: BlockingQueue<Slot<C>>,
    busy: AtomicSet<u64>,
    next_id: AtomicU64,
    // serializes capacity growth so max is never overshot
    grow: Mutex<()>,
    stop: AtomicBool,
    signal: StopSignal,
    monitor_interval: Duration,
    max_idle: Duration,
}

/// Pool of leased connections generic over the [`Connection`] contract.
pub struct ConnPool<C: Connection + Default> {
    inner: Arc<Inner<C>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Exclusive lease on a pooled connection; releases back to the pool on
/// drop. The pool health-checks the connection on the way back in and
/// drops it if it died while leased.
pub struct Lease<C: Connection + Default> {
    slot: Option<Slot<C>>,
    pool: Arc<Inner<C>>,
}

impl<C: Connection + Default> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.slot.as_ref().expect("lease already released").conn
    }
}

impl<C: Connection + Default> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.slot.as_mut().expect("lease already released").conn
    }
}

impl<C: Connection + Default> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

impl<C: Connection + Default> ConnPool<C> {
    /// Open a pool prefilled to `min_size` connections. The connection
    /// string is forwarded opaquely to every connection via
    /// [`Connection::set_info`].
    pub fn new(conn_str: impl Into<String>, config: PoolConfig) -> Self {
        let inner = Arc::new(Inner {
            conn_str: conn_str.into(),
            min_size: AtomicUsize::new(config.min_size.min(config.max_size)),
            max_size: AtomicUsize::new(config.max_size),
            count: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            idle: BlockingQueue::new(),
            busy: AtomicSet::new(),
            next_id: AtomicU64::new(0),
            grow: Mutex::new(()),
            stop: AtomicBool::new(false),
            signal: StopSignal::new(),
            monitor_interval: config.monitor_interval,
            max_idle: config.max_idle,
        });

        for _ in 0..inner.min() {
            inner.add_conn();
        }

        let monitor_inner = Arc::clone(&inner);
        let monitor = thread::Builder::new()
            .name("connpool-monitor".to_string())
            .spawn(move || monitor_proc(&monitor_inner))
            .expect("failed to spawn pool monitor");

        Self {
            inner,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    /// Lease a healthy connection, blocking until one is available.
    ///
    /// Dead connections encountered on the way are discarded without
    /// being handed out; the monitor replaces them later.
    pub fn acquire(&self) -> Lease<C> {
        let inner = &self.inner;
        inner.waiting.fetch_add(1, Ordering::AcqRel);
        loop {
            let mut slot = match inner.idle.try_get() {
                Some(slot) => slot,
                None => {
                    // no-op when already at max; then we block on a release
                    inner.add_conn();
                    inner.idle.get()
                }
            };
            if slot.conn.ping() {
                inner.waiting.fetch_sub(1, Ordering::AcqRel);
                inner.busy.insert(slot.id);
                return Lease {
                    slot: Some(slot),
                    pool: Arc::clone(inner),
                };
            }
            inner.retire(slot);
        }
    }

    /// Open connections (idle plus leased).
    pub fn len(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Currently leased connections.
    pub fn busy_size(&self) -> usize {
        self.inner.busy.len()
    }

    pub fn idle_size(&self) -> usize {
        self.inner.idle.len()
    }

    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::Acquire)
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
}

impl<C: Connection + Default> Drop for ConnPool<C> {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.signal.fire();
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
        // idle connections close here; outstanding leases stay valid
        // until their holders drop them
        while let Some(slot) = self.inner.idle.try_get() {
            self.inner.retire(slot);
        }
    }
}

impl<C: Connection + Default> Inner<C> {
    fn min(&self) -> usize {
        self.min_size.load(Ordering::Acquire)
    }

    fn max(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    /// Return a lease. Unknown slots (already released) are a no-op;
    /// connections that died while leased are dropped instead of
    /// re-queued.
    fn release(&self, mut slot: Slot<C>) {
        if !self.busy.remove(&slot.id) {
            return;
        }
        if !self.stop.load(Ordering::Acquire) && slot.conn.ping() {
            self.idle.put(slot);
        } else {
            self.retire(slot);
        }
    }

    fn retire(&self, mut slot: Slot<C>) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        slot.conn.close();
    }

    fn check_scale(&self, watermark: &mut IdleWatermark) {
        let idle = self.idle.len();
        let reclaim = watermark
            .observe(idle)
            .min(self.count.load(Ordering::Acquire).saturating_sub(self.min()));
        if reclaim > 0 {
            tracing::debug!(reclaim, "closing idle pool connections");
            for _ in 0..reclaim {
                match self.idle.try_get() {
                    Some(slot) => self.retire(slot),
                    None => break,
                }
            }
        }

        let count = self.count.load(Ordering::Acquire);
        let waiting = self.waiting.load(Ordering::Acquire);
        let deficit = self.min().saturating_sub(count);
        let demand = waiting.max(deficit).min(self.max().saturating_sub(count));
        for _ in 0..demand {
            self.add_conn();
        }
    }

    /// Probe idle connections until a live one is observed, replacing
    /// any that died silently.
    fn check_connection(&self) {
        while let Some(mut slot) = self.idle.try_get() {
            if slot.conn.ping() {
                self.idle.put(slot);
                break;
            }
            tracing::debug!("replacing dead idle connection");
            self.retire(slot);
            self.add_conn();
        }
    }

    /// Open one connection and park it in idle; a no-op at capacity or
    /// on connect failure.
    fn add_conn(&self) {
        let _guard = self.grow.lock();
        if self.count.load(Ordering::Acquire) >= self.max() {
            return;
        }
        let mut conn = C::default();
        conn.set_info(&self.conn_str);
        if conn.connect() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.count.fetch_add(1, Ordering::AcqRel);
            self.idle.put(Slot { id, conn });
        } else {
            tracing::warn!("pool connection attempt failed");
        }
    }
}

fn monitor_proc<C: Connection + Default>(inner: &Inner<C>) {
    let mut watermark = IdleWatermark::new(inner.monitor_interval, inner.max_idle);
    while !inner.signal.wait_for(inner.monitor_interval) {
        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        inner.check_scale(&mut watermark);
        inner.check_connection();
    }
}
