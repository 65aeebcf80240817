//! Keepalive selector
//!
//! Holds idle kept-alive connections without a worker thread each. One
//! selector thread polls every registered socket; readiness or deadline
//! expiry hands the link back to the pool through the link's wakers.
//!
//! ```text
//!   worker: process_keepalive ──► selector.keepalive(link) ──► detach
//!                                         │
//!   selector thread: poll(2) ─► ready ─► link.request_wake_keepalive()   ─► Keepalive task
//!                             └► expired ► link.request_timeout_keepalive() ─► KeepaliveTimeout task
//! ```
//!
//! A registration is consumed by the event that fires it; a link that
//! wants to keep waiting registers again.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::Mutex;
use tcplink_core::LinkId;

use crate::link::Link;
use crate::socket::poll_slice;

/// Longest single poll; registrations added meanwhile interrupt it
const SELECT_POLL_MAX: Duration = Duration::from_millis(250);

/// Default registration limit of [`PollSelector`]
pub const SELECT_CAPACITY: usize = 65536;

/// Watches kept-alive links on behalf of the pool.
///
/// **Contract:**
/// - `keepalive()` never blocks. `true` means the selector now owns the
///   wake: exactly one of `request_wake_keepalive` or
///   `request_timeout_keepalive` will be called for the registration,
///   unless `close_keepalive` removes it first.
/// - `false` means the link is not watched; the caller keeps waiting on
///   its own thread.
pub trait Selector: Send + Sync {
    fn keepalive(&self, link: &Arc<Link>) -> bool;

    /// Forget a registration (link destroyed)
    fn close_keepalive(&self, link: &Link);

    /// Links currently watched
    fn select_count(&self) -> usize;

    fn close(&self) {}
}

struct Registration {
    link: Arc<Link>,
    stream: TcpStream,
    expires: Instant,
}

struct Inner {
    registrations: Mutex<HashMap<LinkId, Arc<Registration>>>,
    capacity: usize,
    closed: AtomicBool,
    waker_tx: UnixStream,
    waker_rx: UnixStream,
}

impl Inner {
    fn wake(&self) {
        // A full pipe already guarantees a wake
        let _ = (&self.waker_tx).write(&[1]);
    }

    fn drain_waker(&self) {
        let mut buf = [0u8; 64];
        while matches!((&self.waker_rx).read(&mut buf), Ok(n) if n > 0) {}
    }

    /// Remove `reg` only if it is still the current registration of its link
    fn take(&self, reg: &Arc<Registration>) -> bool {
        let mut registrations = self.registrations.lock();
        match registrations.get(&reg.link.id()) {
            Some(current) if Arc::ptr_eq(current, reg) => {
                registrations.remove(&reg.link.id());
                true
            }
            _ => false,
        }
    }
}

/// `poll(2)`-based selector with one thread
pub struct PollSelector {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PollSelector {
    pub fn start(name: &str) -> io::Result<Arc<Self>> {
        Self::with_capacity(name, SELECT_CAPACITY)
    }

    pub fn with_capacity(name: &str, capacity: usize) -> io::Result<Arc<Self>> {
        let (waker_tx, waker_rx) = UnixStream::pair()?;
        waker_tx.set_nonblocking(true)?;
        waker_rx.set_nonblocking(true)?;

        let inner = Arc::new(Inner {
            registrations: Mutex::new(HashMap::new()),
            capacity,
            closed: AtomicBool::new(false),
            waker_tx,
            waker_rx,
        });

        let thread_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name(format!("{name}-select"))
            .spawn(move || select_loop(thread_inner))?;

        Ok(Arc::new(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Selector for PollSelector {
    fn keepalive(&self, link: &Arc<Link>) -> bool {
        if self.is_closed() {
            return false;
        }

        let Some(stream) = link.control_stream() else {
            return false;
        };
        let expires = link.timing().idle_expire.unwrap_or_else(Instant::now);

        {
            let mut registrations = self.inner.registrations.lock();
            if registrations.len() >= self.inner.capacity {
                return false;
            }
            registrations.insert(
                link.id(),
                Arc::new(Registration {
                    link: Arc::clone(link),
                    stream,
                    expires,
                }),
            );
        }

        self.inner.wake();
        true
    }

    fn close_keepalive(&self, link: &Link) {
        self.inner.registrations.lock().remove(&link.id());
    }

    fn select_count(&self) -> usize {
        self.inner.registrations.lock().len()
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wake();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.inner.registrations.lock().clear();
    }
}

impl Drop for PollSelector {
    fn drop(&mut self) {
        self.close();
    }
}

fn select_loop(inner: Arc<Inner>) {
    while !inner.closed.load(Ordering::Acquire) {
        let snapshot: Vec<Arc<Registration>> =
            inner.registrations.lock().values().cloned().collect();

        let now = Instant::now();
        let wait = snapshot
            .iter()
            .map(|r| r.expires.saturating_duration_since(now))
            .min()
            .unwrap_or(SELECT_POLL_MAX)
            .min(SELECT_POLL_MAX);

        let ready: Vec<bool> = {
            let mut fds = Vec::with_capacity(snapshot.len() + 1);
            fds.push(PollFd::new(inner.waker_rx.as_fd(), PollFlags::POLLIN));
            for reg in &snapshot {
                fds.push(PollFd::new(reg.stream.as_fd(), PollFlags::POLLIN));
            }

            match poll(&mut fds, poll_slice(wait)) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "selector poll failed");
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
            }

            fds.iter()
                .map(|fd| {
                    fd.revents().is_some_and(|r| {
                        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    })
                })
                .collect()
        };

        if ready[0] {
            inner.drain_waker();
        }

        let now = Instant::now();
        for (reg, &is_ready) in snapshot.iter().zip(&ready[1..]) {
            if is_ready {
                if inner.take(reg) {
                    reg.link.request_wake_keepalive();
                }
            } else if reg.expires <= now && inner.take(reg) {
                reg.link.request_timeout_keepalive();
            }
        }
    }

    tracing::debug!("selector exit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_close() {
        let selector = PollSelector::start("test").unwrap();
        assert_eq!(selector.select_count(), 0);
        assert!(!selector.is_closed());

        selector.close();
        assert!(selector.is_closed());
        // Idempotent
        selector.close();
    }

    #[test]
    fn test_waker_drains() {
        let selector = PollSelector::start("test").unwrap();
        for _ in 0..1000 {
            selector.inner.wake();
        }
        selector.inner.drain_waker();
        selector.close();
    }
}
