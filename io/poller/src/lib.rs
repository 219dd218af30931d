//! Edge-triggered readiness notification over epoll.
//!
//! The [`Poller`] owns a kernel readiness object, an eventfd used to
//! break a blocked wait, and the authoritative set of registered
//! descriptors. Registrations are usually edge-triggered and one-shot:
//! after an event fires, the descriptor stays disarmed until an explicit
//! [`Poller::modify`] re-arms it. That one-shot rearm is the contract
//! higher layers rely on to serialize per-descriptor work across worker
//! threads without per-descriptor locks.

use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Upper bound on events returned by a single wait.
const MAX_EVENTS_PER_WAIT: usize = 100;

/// Registration token for the internal wakeup descriptor.
const WAKE_TOKEN: u64 = u64::MAX;

bitflags::bitflags! {
    /// Readiness interest mask for a registered descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READABLE = libc::EPOLLIN as u32;
        const WRITABLE = libc::EPOLLOUT as u32;
        const EDGE = libc::EPOLLET as u32;
        const ONESHOT = libc::EPOLLONESHOT as u32;
    }
}

impl Interest {
    /// The mask the TCP server arms every connection with.
    pub fn read_oneshot() -> Self {
        Self::READABLE | Self::EDGE | Self::ONESHOT
    }
}

/// A single readiness event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    fd: RawFd,
    flags: u32,
}

impl Event {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_readable(&self) -> bool {
        self.flags & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & libc::EPOLLOUT as u32 != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & libc::EPOLLERR as u32 != 0
    }

    pub fn is_hangup(&self) -> bool {
        self.flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0
    }
}

struct Core {
    epoll: OwnedFd,
    wake: OwnedFd,
}

impl Core {
    fn open() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };

        let wfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake = unsafe { OwnedFd::from_raw_fd(wfd) };

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: WAKE_TOKEN,
        };
        let rc = unsafe {
            libc::epoll_ctl(
                epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                wake.as_raw_fd(),
                &mut ev,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { epoll, wake })
    }

    fn post_wakeup(&self) {
        let value: u64 = 1;
        // best effort; a full eventfd counter still wakes the waiter
        unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                std::ptr::from_ref(&value).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }

    fn drain_wakeup(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                std::ptr::from_mut(&mut value).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

fn not_running() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "poller is stopped")
}

/// Readiness notifier backed by epoll.
pub struct Poller {
    core: Mutex<Option<Core>>,
    fds: Mutex<HashSet<RawFd, RandomState>>,
    listening: AtomicBool,
    stopped: AtomicBool,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            core: Mutex::new(Some(Core::open()?)),
            fds: Mutex::new(HashSet::default()),
            listening: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Register `fd` with `interest`. Registering an already-tracked
    /// descriptor is an idempotent success.
    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let core = self.core.lock();
        let core = core.as_ref().ok_or_else(not_running)?;
        let mut fds = self.fds.lock();
        if fds.contains(&fd) {
            return Ok(());
        }
        epoll_ctl(core, libc::EPOLL_CTL_ADD, fd, Some(interest))?;
        fds.insert(fd);
        Ok(())
    }

    /// Replace the interest mask for a registered descriptor; the rearm
    /// path for one-shot registrations. Fails if `fd` was never added.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let core = self.core.lock();
        let core = core.as_ref().ok_or_else(not_running)?;
        let fds = self.fds.lock();
        if !fds.contains(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor is not registered",
            ));
        }
        epoll_ctl(core, libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    /// Deregister `fd`. Removing an unknown descriptor succeeds.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let core = self.core.lock();
        let Some(core) = core.as_ref() else {
            return Ok(());
        };
        let mut fds = self.fds.lock();
        if !fds.remove(&fd) {
            return Ok(());
        }
        epoll_ctl(core, libc::EPOLL_CTL_DEL, fd, None)
    }

    /// Block until readiness events arrive, returning at most
    /// [`MAX_EVENTS_PER_WAIT`] of them. A wakeup posted by [`stop`]
    /// yields an empty batch. Only one thread may wait at a time.
    ///
    /// [`stop`]: Poller::stop
    pub fn wait(&self) -> io::Result<Vec<Event>> {
        self.wait_inner(-1)
    }

    /// [`wait`](Poller::wait) with an upper bound on blocking time.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<Vec<Event>> {
        self.wait_inner(timeout.as_millis().min(i32::MAX as u128) as i32)
    }

    fn wait_inner(&self, timeout_ms: i32) -> io::Result<Vec<Event>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(not_running());
        }
        if self.listening.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                "another thread is already waiting",
            ));
        }
        let result = self.wait_locked(timeout_ms);
        self.listening.store(false, Ordering::Release);
        result
    }

    fn wait_locked(&self, timeout_ms: i32) -> io::Result<Vec<Event>> {
        // The raw descriptor is captured up front; stop() will not close
        // it until the listening flag clears again.
        let epfd = {
            let core = self.core.lock();
            core.as_ref().ok_or_else(not_running)?.epoll.as_raw_fd()
        };

        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS_PER_WAIT];
        let count = loop {
            let rc = unsafe {
                libc::epoll_wait(epfd, raw.as_mut_ptr(), MAX_EVENTS_PER_WAIT as i32, timeout_ms)
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut events = Vec::with_capacity(count);
        for ev in &raw[..count] {
            if ev.u64 == WAKE_TOKEN {
                if let Some(core) = self.core.lock().as_ref() {
                    core.drain_wakeup();
                }
                continue;
            }
            events.push(Event {
                fd: ev.u64 as RawFd,
                flags: ev.events,
            });
        }
        Ok(events)
    }

    /// Break a blocked [`wait`](Poller::wait) without stopping.
    pub fn wake(&self) {
        if let Some(core) = self.core.lock().as_ref() {
            core.post_wakeup();
        }
    }

    /// Post a wakeup, wait for any in-flight wait to return, then close
    /// the kernel objects and clear the registration set.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wake();
        while self.listening.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        *self.core.lock() = None;
        self.fds.lock().clear();
    }

    /// Reopen a stopped poller so its owner can be restarted.
    pub fn restart(&self) -> io::Result<()> {
        let mut core = self.core.lock();
        if core.is_none() {
            *core = Some(Core::open()?);
        }
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of registered descriptors (wakeup fd excluded).
    pub fn registered(&self) -> usize {
        self.fds.lock().len()
    }
}

fn epoll_ctl(core: &Core, op: libc::c_int, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
    let mut ev = libc::epoll_event {
        events: interest.map_or(0, |i| i.bits()),
        u64: fd as u64,
    };
    let rc = unsafe { libc::epoll_ctl(core.epoll.as_raw_fd(), op, fd, &mut ev) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
