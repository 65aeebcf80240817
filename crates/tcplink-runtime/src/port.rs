//! Listening endpoint
//!
//! A `Port` binds one listener and owns everything that serves it:
//!
//! ```text
//!              ┌──────────────────────────── Port ────────────────────────────┐
//!   listener ─►│ acceptors (Accept tasks) ─► Link ◄─ idle pool (ArrayQueue)   │
//!              │        ▲                     │                               │
//!              │   Launcher (workers)          ├─► selector   (keepalive)     │
//!              │                               └─► suspend set (comet) ◄ reaper│
//!              └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Admission control happens at accept: a connection is dropped when the
//! pool is saturated with no selector to park idle clients, or when the
//! open-connection throttle is at `connection_max`.
//!
//! Lifecycle: `new → start → (disable ⇄ enable) → close`. `close` is
//! idempotent and also runs on drop.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use tcplink_core::{LinkError, LinkId, LinkIdGen, LinkResult, PortConfig, TaskKind};

use crate::handler::Protocol;
use crate::launcher::{AcceptorSource, Launcher, WorkItem};
use crate::link::Link;
use crate::reaper::{self, ReaperHandle};
use crate::selector::{PollSelector, Selector};
use crate::shutdown::ShutdownSignal;
use crate::socket::{self, LinkSocket};
use crate::stats::{PortStats, StatsSnapshot};
use crate::task::Task;
use crate::throttle::Throttle;

/// Keepalive threads above this count get a short wait before the selector
const KEEPALIVE_THREAD_THROTTLE: usize = 32;
const KEEPALIVE_THROTTLE_WAIT: Duration = Duration::from_millis(100);

/// Extra wake connects sent at close beyond the idle acceptor count
const CLOSE_WAKE_EXTRA: usize = 10;
const CLOSE_WAKE_SLEEP: Duration = Duration::from_millis(10);

/// How long a worker waits for the next request before handing the link
/// to the selector. Zero hands it over at once, which only happens under
/// load: more than `KEEPALIVE_THREAD_THROTTLE` waiters and a throttled pool.
fn keepalive_thread_wait(
    config: &PortConfig,
    select: bool,
    waiting: usize,
    throttled: impl FnOnce() -> bool,
) -> Duration {
    let timeout = config.keepalive_timeout.min(config.socket_timeout);
    if !select {
        return timeout;
    }

    let timeout = timeout.min(config.keepalive_select_thread_timeout);
    if waiting <= KEEPALIVE_THREAD_THROTTLE {
        timeout
    } else if throttled() {
        Duration::ZERO
    } else {
        timeout.min(KEEPALIVE_THROTTLE_WAIT)
    }
}

/// Result of a short keepalive read on the worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadProbe {
    Data(usize),
    Timeout,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Lifecycle {
    New = 0,
    Active = 1,
    Disabled = 2,
    Closed = 3,
}

impl From<u8> for Lifecycle {
    fn from(v: u8) -> Self {
        match v {
            0 => Lifecycle::New,
            1 => Lifecycle::Active,
            2 => Lifecycle::Disabled,
            _ => Lifecycle::Closed,
        }
    }
}

struct CountGuard<'a>(&'a AtomicUsize);

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// State shared by the port handle, its links and its threads
pub(crate) struct PortShared {
    config: PortConfig,
    protocol: Arc<dyn Protocol>,
    launcher: Arc<Launcher<Task>>,
    listener: OnceLock<TcpListener>,
    lifecycle: AtomicU8,

    throttle: Throttle,
    stats: PortStats,
    selector: OnceLock<Arc<dyn Selector>>,

    ids: LinkIdGen,
    active: DashMap<LinkId, Arc<Link>>,
    suspended: DashMap<LinkId, Arc<Link>>,
    idle_pool: ArrayQueue<Arc<Link>>,

    keepalive_count: AtomicUsize,
    keepalive_thread_count: AtomicUsize,

    shutdown: ShutdownSignal,
    reaper: Mutex<Option<ReaperHandle>>,
    this: Weak<PortShared>,
}

impl PortShared {
    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub(crate) fn config(&self) -> &PortConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn launcher(&self) -> &Arc<Launcher<Task>> {
        &self.launcher
    }

    #[inline]
    pub(crate) fn stats(&self) -> &PortStats {
        &self.stats
    }

    #[inline]
    pub(crate) fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    #[inline]
    pub(crate) fn selector(&self) -> Option<&Arc<dyn Selector>> {
        self.selector.get()
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from(self.lifecycle.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.lifecycle() == Lifecycle::Closed
    }

    #[inline]
    fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    fn is_keepalive_async_enabled(&self) -> bool {
        self.selector.get().is_some()
    }

    /// Pool close to its limit with few spare acceptors
    fn is_async_throttle(&self) -> bool {
        self.launcher.is_thread_high() && self.launcher.is_idle_low()
    }

    // ========================================================================
    // Link pool
    // ========================================================================

    /// Reuse an idle link or create one
    pub(crate) fn allocate_link(&self) -> Option<Arc<Link>> {
        while let Some(link) = self.idle_pool.pop() {
            if link.request_state().is_destroyed() {
                continue;
            }
            link.reset_for_reuse();
            self.active.insert(link.id(), Arc::clone(&link));
            return Some(link);
        }

        let port = self.this.upgrade()?;
        let id = self.ids.next();
        let link = Link::new(id, port, self.protocol.create_handler(id));
        self.active.insert(id, Arc::clone(&link));
        tracing::trace!(link = %id, "link created");
        Some(link)
    }

    /// Park a link whose connection ended
    pub(crate) fn free(&self, link: Arc<Link>) {
        self.active.remove(&link.id());

        if self.is_closed() {
            link.request_destroy();
            return;
        }
        if let Err(link) = self.idle_pool.push(link) {
            tracing::trace!(link = %link.id(), "idle pool full");
            link.request_destroy();
        }
    }

    pub(crate) fn connection_closed(&self, id: LinkId) {
        self.active.remove(&id);
    }

    // ========================================================================
    // Accept
    // ========================================================================

    /// Block for the next admitted connection. `None` when the port closes.
    pub(crate) fn accept_connection(&self) -> LinkResult<Option<LinkSocket>> {
        let Some(listener) = self.listener.get() else {
            return Ok(None);
        };

        while !self.is_closed() {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(_) if self.is_closed() => return Ok(None),
                Err(e) if matches!(e.raw_os_error(), Some(libc::ENOMEM | libc::ENOBUFS)) => {
                    self.shutdown.shutdown_fatal(format!("accept: {e}"));
                    return Err(LinkError::ResourceExhausted("accept"));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    if matches!(e.raw_os_error(), Some(libc::EMFILE | libc::ENFILE)) {
                        thread::sleep(self.launcher.config().throttle_sleep);
                    }
                    continue;
                }
            };

            if self.is_closed() {
                return Ok(None);
            }
            if !self.is_active() {
                tracing::debug!(%peer, "port disabled, dropping connection");
                continue;
            }

            // Saturated and nowhere to park idle keepalives
            if self.launcher.is_thread_max()
                && !self.is_keepalive_async_enabled()
                && self.launcher.idle_count() <= 1
            {
                self.stats.add_throttle_disconnect();
                tracing::debug!(%peer, "worker pool saturated, dropping connection");
                continue;
            }

            if !self.throttle.accept() {
                self.stats.add_throttle_disconnect();
                tracing::debug!(%peer, open = self.throttle.open_count(), "connection limit, dropping connection");
                continue;
            }

            let socket = match LinkSocket::new(stream, peer) {
                Ok(socket) => socket,
                Err(e) => {
                    self.throttle.close();
                    tracing::debug!(%peer, error = %e, "cannot set up connection");
                    continue;
                }
            };
            if let Err(e) = socket.configure(self.config.socket_timeout, self.config.tcp_nodelay) {
                tracing::debug!(%peer, error = %e, "socket options failed");
            }

            self.stats.add_connection();
            return Ok(Some(socket));
        }

        Ok(None)
    }

    /// Release a throttle slot taken at accept
    pub(crate) fn close_socket(&self) {
        self.throttle.close();
    }

    // ========================================================================
    // Keepalive policy
    // ========================================================================

    /// May the connection started at `connection_start` stay open after
    /// this request?
    pub(crate) fn is_keepalive_allowed(&self, connection_start: Option<Instant>) -> bool {
        if !self.is_active() {
            return false;
        }
        if connection_start.is_some_and(|start| start.elapsed() >= self.config.keepalive_time_max) {
            return false;
        }
        if self.keepalive_count.load(Ordering::Acquire) >= self.config.keepalive_max {
            return false;
        }
        if !self.is_keepalive_async_enabled()
            && self.launcher.is_thread_max()
            && self.launcher.is_idle_low()
        {
            return false;
        }
        true
    }

    pub(crate) fn keepalive_allocate(&self) {
        self.keepalive_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn keepalive_free(&self) {
        let _ = self
            .keepalive_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Short wait for the next request on the worker thread before the
    /// link moves to the selector
    pub(crate) fn keepalive_thread_read(&self, socket: &mut LinkSocket) -> LinkResult<ReadProbe> {
        if self.is_closed() {
            return Ok(ReadProbe::Eof);
        }
        if socket.available() > 0 {
            return Ok(ReadProbe::Data(socket.available()));
        }

        let waiting = self.keepalive_thread_count.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = CountGuard(&self.keepalive_thread_count);

        let timeout = keepalive_thread_wait(
            &self.config,
            self.is_keepalive_async_enabled(),
            waiting,
            || self.is_async_throttle(),
        );
        if timeout.is_zero() {
            return Ok(ReadProbe::Timeout);
        }

        match socket.fill_with_timeout(timeout) {
            Ok(0) => Ok(ReadProbe::Eof),
            Ok(n) => Ok(ReadProbe::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(ReadProbe::Timeout),
            Err(_) if self.is_closed() => Ok(ReadProbe::Eof),
            Err(e) => Err(LinkError::from_io(e)),
        }
    }

    // ========================================================================
    // Suspend set
    // ========================================================================

    pub(crate) fn comet_suspend(&self, link: &Arc<Link>) {
        self.suspended.insert(link.id(), Arc::clone(link));
    }

    pub(crate) fn comet_detach(&self, id: LinkId) {
        self.suspended.remove(&id);
    }

    /// One reaper sweep. Returns (timeouts, closes) requested.
    pub(crate) fn reap_suspended(&self, now: Instant) -> (usize, usize) {
        let links: Vec<Arc<Link>> = self.suspended.iter().map(|e| Arc::clone(e.value())).collect();
        let close_after = self.config.suspend_close_time_max;

        let mut timeouts = 0;
        let mut closes = 0;

        for link in links {
            let timing = link.timing();

            if timing.idle_expire.is_some_and(|expire| expire <= now) {
                if link.request_comet_timeout() {
                    timeouts += 1;
                }
            } else if timing.idle_start.is_some_and(|start| start + close_after <= now)
                && link.is_read_eof()
            {
                tracing::debug!(link = %link.id(), "suspended peer gone");
                if link.request_comet_close() {
                    closes += 1;
                }
            }
        }

        (timeouts, closes)
    }

    // ========================================================================
    // Close
    // ========================================================================

    pub(crate) fn close(&self) {
        let prev = Lifecycle::from(self.lifecycle.swap(Lifecycle::Closed as u8, Ordering::AcqRel));
        if prev == Lifecycle::Closed {
            return;
        }
        tracing::info!(name = %self.launcher.config().name, "port closing");

        self.launcher.close();

        let reaper = self.reaper.lock().take();
        if let Some(stats) = reaper.and_then(ReaperHandle::stop) {
            tracing::debug!(sweeps = stats.sweeps, timeouts = stats.timeouts, closes = stats.closes, "reaper stopped");
        }

        let links: Vec<Arc<Link>> = self.active.iter().map(|e| Arc::clone(e.value())).collect();
        for link in links {
            link.request_destroy();
        }

        if prev != Lifecycle::New {
            self.wake_acceptors();
        }
        if let Some(listener) = self.listener.get() {
            socket::shutdown_listener(listener);
        }

        while let Some(link) = self.idle_pool.pop() {
            link.request_destroy();
        }

        if let Some(selector) = self.selector.get() {
            selector.close();
        }
        self.suspended.clear();

        tracing::info!(name = %self.launcher.config().name, "port closed");
    }

    /// Connect to ourselves so acceptors blocked in accept(2) return
    fn wake_acceptors(&self) {
        let Some(addr) = self.listener.get().and_then(|l| l.local_addr().ok()) else {
            return;
        };

        let ip = match addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let target = SocketAddr::new(ip, addr.port());

        let attempts = self.launcher.idle_count() + CLOSE_WAKE_EXTRA;
        for _ in 0..attempts {
            if self.launcher.idle_count() == 0 {
                break;
            }
            let _ = TcpStream::connect_timeout(&target, Duration::from_millis(100));
            thread::sleep(CLOSE_WAKE_SLEEP);
        }
    }
}

impl AcceptorSource for PortShared {
    fn start_acceptor(&self) -> bool {
        if !self.is_active() {
            return false;
        }

        let Some(link) = self.allocate_link() else {
            return false;
        };
        if !link.request_accept() {
            self.active.remove(&link.id());
            return false;
        }

        match self.launcher.submit_accept(Task::new(TaskKind::Accept, link)) {
            Ok(()) => true,
            Err(task) => {
                task.abandon();
                false
            }
        }
    }
}

// ============================================================================
// Port handle
// ============================================================================

/// A listening endpoint and its worker pool
pub struct Port {
    shared: Arc<PortShared>,
}

impl Port {
    pub fn new(config: PortConfig, protocol: impl Protocol) -> LinkResult<Self> {
        Self::with_shutdown(config, protocol, ShutdownSignal::new())
    }

    /// Share a process-wide shutdown signal with other ports
    pub fn with_shutdown(
        config: PortConfig,
        protocol: impl Protocol,
        shutdown: ShutdownSignal,
    ) -> LinkResult<Self> {
        config.validate()?;

        let launcher = Launcher::new(config.launcher.clone(), shutdown.clone());
        let protocol: Arc<dyn Protocol> = Arc::new(protocol);

        let shared = Arc::new_cyclic(|this| PortShared {
            throttle: Throttle::new(config.connection_max),
            idle_pool: ArrayQueue::new(config.idle_pool_capacity.max(1)),
            protocol,
            launcher,
            listener: OnceLock::new(),
            lifecycle: AtomicU8::new(Lifecycle::New as u8),
            stats: PortStats::new(),
            selector: OnceLock::new(),
            ids: LinkIdGen::new(),
            active: DashMap::new(),
            suspended: DashMap::new(),
            keepalive_count: AtomicUsize::new(0),
            keepalive_thread_count: AtomicUsize::new(0),
            shutdown,
            reaper: Mutex::new(None),
            this: this.clone(),
            config,
        });

        Ok(Self { shared })
    }

    /// Use a custom selector for keepalive. Must be set before `start`.
    pub fn with_selector(self, selector: Arc<dyn Selector>) -> Self {
        if self.shared.selector.set(selector).is_err() {
            tracing::warn!("selector already set");
        }
        self
    }

    /// Bind the listener without starting workers
    pub fn bind(&self) -> LinkResult<SocketAddr> {
        if let Some(listener) = self.shared.listener.get() {
            return Ok(listener.local_addr()?);
        }

        let config = &self.shared.config;
        let listener = socket::bind_listener(config.socket_addr(), config.accept_backlog)?;
        let addr = listener.local_addr()?;

        if self.shared.listener.set(listener).is_err() {
            // Lost a bind race; use the winner
            return self.bind();
        }
        tracing::info!(%addr, "port bound");
        Ok(addr)
    }

    /// Bind if needed and start accepting
    pub fn start(&self) -> LinkResult<SocketAddr> {
        let addr = self.bind()?;

        if self
            .shared
            .lifecycle
            .compare_exchange(
                Lifecycle::New as u8,
                Lifecycle::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return match self.shared.lifecycle() {
                Lifecycle::Closed => Err(LinkError::PortClosed),
                _ => Ok(addr),
            };
        }

        let config = &self.shared.config;
        let name = config.launcher.name.clone();

        if config.keepalive_select_enable && self.shared.selector.get().is_none() {
            let selector: Arc<dyn Selector> = PollSelector::start(&name)?;
            let _ = self.shared.selector.set(selector);
        }

        let shared: Weak<PortShared> = Arc::downgrade(&self.shared);
        let source: Weak<dyn AcceptorSource> = shared;
        self.shared.launcher.start(Some(source))?;

        let reaper = reaper::spawn_reaper(
            &name,
            Arc::downgrade(&self.shared),
            config.suspend_reaper_interval,
        )?;
        *self.shared.reaper.lock() = Some(reaper);

        self.shared.launcher.wake_launcher();

        tracing::info!(
            %addr,
            name = %name,
            idle_min = config.launcher.idle_min,
            idle_max = config.launcher.idle_max,
            thread_max = config.launcher.thread_max,
            selector = self.shared.selector.get().is_some(),
            "port started"
        );
        Ok(addr)
    }

    /// Resume accepting after `disable`
    pub fn enable(&self) -> LinkResult<()> {
        self.shared
            .lifecycle
            .compare_exchange(
                Lifecycle::Disabled as u8,
                Lifecycle::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| LinkError::PortClosed)?;

        if let Some(listener) = self.shared.listener.get() {
            socket::set_backlog(listener, self.shared.config.accept_backlog)?;
        }
        self.shared.launcher.wake_launcher();
        tracing::info!("port enabled");
        Ok(())
    }

    /// Stop admitting connections; existing ones keep running
    pub fn disable(&self) -> LinkResult<()> {
        self.shared
            .lifecycle
            .compare_exchange(
                Lifecycle::Active as u8,
                Lifecycle::Disabled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| LinkError::PortClosed)?;

        if let Some(listener) = self.shared.listener.get() {
            socket::set_backlog(listener, 0)?;
        }
        tracing::info!("port disabled");
        Ok(())
    }

    pub fn close(&self) {
        self.shared.close();
    }

    /// Close, then wait up to `timeout` for workers to exit
    pub fn close_and_wait(&self, timeout: Duration) -> bool {
        self.shared.close();
        self.shared.launcher.join_workers(timeout)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<PortShared> {
        &self.shared
    }

    pub fn config(&self) -> &PortConfig {
        &self.shared.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.listener.get().and_then(|l| l.local_addr().ok())
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shared.shutdown
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn selector(&self) -> Option<Arc<dyn Selector>> {
        self.shared.selector.get().cloned()
    }

    /// Links allocated to acceptors or connections
    pub fn links(&self) -> Vec<Arc<Link>> {
        self.shared.active.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn active_connection_count(&self) -> usize {
        self.shared.active.len()
    }

    pub fn keepalive_connection_count(&self) -> usize {
        self.shared.keepalive_count.load(Ordering::Acquire)
    }

    pub fn keepalive_thread_count(&self) -> usize {
        self.shared.keepalive_thread_count.load(Ordering::Acquire)
    }

    pub fn select_count(&self) -> usize {
        self.shared.selector.get().map_or(0, |s| s.select_count())
    }

    pub fn comet_idle_count(&self) -> usize {
        self.shared.suspended.len()
    }

    pub fn idle_pool_count(&self) -> usize {
        self.shared.idle_pool.len()
    }

    pub fn open_connection_count(&self) -> usize {
        self.shared.throttle.open_count()
    }

    pub fn thread_count(&self) -> usize {
        self.shared.launcher.thread_count()
    }

    pub fn idle_thread_count(&self) -> usize {
        self.shared.launcher.idle_count()
    }

    pub fn active_thread_count(&self) -> usize {
        self.shared.launcher.active_count()
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("addr", &self.local_addr())
            .field("lifecycle", &self.shared.lifecycle())
            .field("links", &self.active_connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{LinkContext, RequestHandler};

    struct Noop;

    impl RequestHandler for Noop {
        fn handle_request(&mut self, _cx: &mut LinkContext<'_>) -> LinkResult<bool> {
            Ok(false)
        }
    }

    struct NoopProtocol;

    impl Protocol for NoopProtocol {
        fn create_handler(&self, _link: LinkId) -> Box<dyn RequestHandler> {
            Box::new(Noop)
        }
    }

    fn config() -> PortConfig {
        PortConfig::new()
            .bind("127.0.0.1:0")
            .unwrap()
            .keepalive_select(false)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = config().accept_idle(8, 2);
        assert!(matches!(
            Port::new(config, NoopProtocol),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_lifecycle() {
        let port = Port::new(config(), NoopProtocol).unwrap();
        assert!(!port.is_active());
        assert!(port.enable().is_err());

        let addr = port.start().unwrap();
        assert_eq!(port.local_addr(), Some(addr));
        assert!(port.is_active());

        port.disable().unwrap();
        assert!(!port.is_active());
        port.enable().unwrap();
        assert!(port.is_active());

        port.close();
        assert!(port.is_closed());
        assert!(matches!(port.start(), Err(LinkError::PortClosed)));
        // Idempotent
        port.close();
    }

    #[test]
    fn test_keepalive_policy() {
        let port = Port::new(config().keepalive_max(1), NoopProtocol).unwrap();
        let shared = port.shared();

        // Not started
        assert!(!shared.is_keepalive_allowed(Some(Instant::now())));

        shared.lifecycle.store(Lifecycle::Active as u8, Ordering::Release);
        assert!(shared.is_keepalive_allowed(Some(Instant::now())));

        // Lifetime budget spent
        let old = Instant::now()
            .checked_sub(shared.config.keepalive_time_max + Duration::from_secs(1));
        if old.is_some() {
            assert!(!shared.is_keepalive_allowed(old));
        }

        // Count budget spent
        shared.keepalive_allocate();
        assert!(!shared.is_keepalive_allowed(Some(Instant::now())));
        shared.keepalive_free();
        assert!(shared.is_keepalive_allowed(Some(Instant::now())));

        // Never underflows
        shared.keepalive_free();
        assert_eq!(port.keepalive_connection_count(), 0);

        shared.lifecycle.store(Lifecycle::New as u8, Ordering::Release);
    }

    #[test]
    fn test_keepalive_thread_wait() {
        let config = config()
            .keepalive_timeout(Duration::from_secs(15))
            .keepalive_select_thread_timeout(Duration::from_secs(1));
        let full = config.keepalive_timeout.min(config.socket_timeout);

        // No selector: the whole keepalive wait stays on the thread
        assert_eq!(keepalive_thread_wait(&config, false, 100, || true), full);

        // Few waiters: a throttled pool still gets the short thread wait
        assert_eq!(
            keepalive_thread_wait(&config, true, KEEPALIVE_THREAD_THROTTLE, || true),
            Duration::from_secs(1)
        );

        // Many waiters
        let many = KEEPALIVE_THREAD_THROTTLE + 1;
        assert_eq!(
            keepalive_thread_wait(&config, true, many, || false),
            KEEPALIVE_THROTTLE_WAIT
        );
        assert_eq!(keepalive_thread_wait(&config, true, many, || true), Duration::ZERO);
    }

    #[test]
    fn test_allocate_assigns_unique_ids() {
        let port = Port::new(config(), NoopProtocol).unwrap();
        let a = port.shared().allocate_link().unwrap();
        let b = port.shared().allocate_link().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(port.active_connection_count(), 2);
    }

    #[test]
    fn test_close_wakes_acceptors() {
        let config = config().accept_idle(2, 4).thread_max(4);
        let port = Port::new(config, NoopProtocol).unwrap();
        port.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while port.idle_thread_count() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(port.idle_thread_count() >= 2);

        assert!(port.close_and_wait(Duration::from_secs(5)));
        assert_eq!(port.idle_thread_count(), 0);
        assert_eq!(port.active_connection_count(), 0);
    }
}
