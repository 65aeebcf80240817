//! Elastic worker pool
//!
//! The launcher owns two bounded lock-free queues and a variable number of
//! OS worker threads:
//!
//! ```text
//!                  submit_accept()              submit_resume()
//!                        │                            │
//!                        ▼                            ▼
//!                ┌──────────────┐            ┌──────────────┐
//!                │ accept_queue │            │ resume_queue │
//!                └──────┬───────┘            └──────┬───────┘
//!                       └────────────┬──────────────┘
//!                                    ▼   accept first
//!                ┌─────────────────────────────────────────┐
//!                │ worker-0   worker-1   ...   worker-N    │  N ≤ thread_max
//!                └─────────────────────────────────────────┘
//!                       ▲ park / unpark          ▲ spawn (rate throttled)
//!                       └──────── launcher thread ┘
//!                            keeps idle acceptors ≥ idle_min
//! ```
//!
//! # Counters
//!
//! - `thread_count`: live workers, reserved by CAS before a spawn, so it
//!   never exceeds `thread_max`
//! - `starting_count`: spawned but not yet polling
//! - `active_count`: running a task (acceptors blocked in accept included)
//! - `idle_count`: acceptors blocked in accept, bounded by `idle_max`
//! - `pending_resume`: wakes issued for resume work, not yet picked up
//!
//! Queue offers never block. A full queue hands the item back to the caller
//! and logs a warning.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use tcplink_core::LauncherConfig;

use crate::shutdown::ShutdownSignal;

/// Poll interval of the launcher thread when there is nothing to do
const LAUNCHER_POLL: Duration = Duration::from_millis(250);

/// Unit of work run by a pool worker
pub trait WorkItem: Send + 'static {
    /// Execute on the calling worker thread
    fn run(self);

    /// Dropped from a queue because the launcher closed
    fn abandon(self)
    where
        Self: Sized,
    {
    }
}

/// Supplies acceptor work when idle acceptors run low.
///
/// **Contract:**
/// - `start_acceptor()` must not block. It queues one accept item through
///   [`Launcher::submit_accept`] and reports whether it did.
pub trait AcceptorSource: Send + Sync {
    fn start_acceptor(&self) -> bool;
}

#[derive(Debug, Default)]
struct Parked {
    waiting: usize,
    permits: usize,
}

#[derive(Debug)]
struct StartWindow {
    start: Instant,
    count: usize,
}

/// Elastic pool coordinator
pub struct Launcher<T: WorkItem> {
    config: LauncherConfig,

    accept_queue: ArrayQueue<T>,
    resume_queue: ArrayQueue<T>,

    thread_count: AtomicUsize,
    starting_count: AtomicUsize,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    pending_resume: AtomicUsize,
    parked_count: AtomicUsize,

    parked: Mutex<Parked>,
    park_cond: Condvar,

    launch_wake: Mutex<bool>,
    launch_cond: Condvar,

    window: Mutex<StartWindow>,

    closed: AtomicBool,
    thread_seq: AtomicUsize,
    spawn_total: AtomicU64,

    source: Mutex<Option<Weak<dyn AcceptorSource>>>,
    launcher_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: ShutdownSignal,
}

impl<T: WorkItem> Launcher<T> {
    pub fn new(config: LauncherConfig, shutdown: ShutdownSignal) -> Arc<Self> {
        Arc::new(Self {
            accept_queue: ArrayQueue::new(config.accept_queue_capacity.max(1)),
            resume_queue: ArrayQueue::new(config.resume_queue_capacity.max(1)),
            thread_count: AtomicUsize::new(0),
            starting_count: AtomicUsize::new(0),
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            pending_resume: AtomicUsize::new(0),
            parked_count: AtomicUsize::new(0),
            parked: Mutex::new(Parked::default()),
            park_cond: Condvar::new(),
            launch_wake: Mutex::new(false),
            launch_cond: Condvar::new(),
            window: Mutex::new(StartWindow {
                start: Instant::now(),
                count: 0,
            }),
            closed: AtomicBool::new(false),
            thread_seq: AtomicUsize::new(0),
            spawn_total: AtomicU64::new(0),
            source: Mutex::new(None),
            launcher_thread: Mutex::new(None),
            shutdown,
            config,
        })
    }

    /// Start the launcher thread. `source` provides acceptors; `None` runs
    /// the pool for queued work only.
    pub fn start(self: &Arc<Self>, source: Option<Weak<dyn AcceptorSource>>) -> std::io::Result<()> {
        *self.source.lock() = source;

        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-launcher", self.config.name))
            .spawn(move || this.launcher_loop())?;

        *self.launcher_thread.lock() = Some(handle);
        Ok(())
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Queue an accept item and make sure a worker will pick it up
    pub fn submit_accept(self: &Arc<Self>, item: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(item);
        }

        if let Err(item) = self.accept_queue.push(item) {
            tracing::warn!(
                queued = self.accept_queue.len(),
                "accept queue full, dropping offer"
            );
            return Err(item);
        }

        if !self.unpark_one() {
            self.spawn_worker();
        }
        Ok(())
    }

    /// Queue a resume item and wake a worker for it
    pub fn submit_resume(self: &Arc<Self>, item: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(item);
        }

        if let Err(item) = self.resume_queue.push(item) {
            tracing::warn!(
                queued = self.resume_queue.len(),
                "resume queue full, dropping offer"
            );
            return Err(item);
        }

        self.wake_resume_task(1);
        Ok(())
    }

    /// Start up to `min` workers for queued resume work.
    ///
    /// Each round computes the headroom `thread_max - (active + starting +
    /// pending_resume)`, stops when there is none or when every queued item
    /// already has a pending wake, then claims one wake by CAS on
    /// `pending_resume` before scheduling a worker.
    pub fn wake_resume_task(self: &Arc<Self>, min: usize) {
        let mut started = 0;

        while started < min && !self.is_closed() {
            let pending = self.pending_resume.load(Ordering::Acquire);
            let queued = self.resume_queue.len();

            if queued <= pending {
                return;
            }

            let busy = self.active_count.load(Ordering::Acquire)
                + self.starting_count.load(Ordering::Acquire)
                + pending;
            if busy >= self.config.thread_max {
                return;
            }

            if self
                .pending_resume
                .compare_exchange(pending, pending + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            if self.schedule_worker() {
                started += 1;
            } else {
                self.consume_pending();
                return;
            }
        }
    }

    fn schedule_worker(self: &Arc<Self>) -> bool {
        self.unpark_one() || self.spawn_worker()
    }

    fn consume_pending(&self) {
        let _ = self
            .pending_resume
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    // ========================================================================
    // Threads
    // ========================================================================

    fn spawn_worker(self: &Arc<Self>) -> bool {
        if self.is_closed() {
            return false;
        }

        let max = self.config.thread_max;
        if self
            .thread_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return false;
        }

        if !self.allow_start() {
            self.thread_count.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        self.starting_count.fetch_add(1, Ordering::AcqRel);

        let id = self.thread_seq.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", self.config.name, id))
            .spawn(move || this.worker_loop());

        match spawned {
            Ok(_) => {
                self.spawn_total.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.starting_count.fetch_sub(1, Ordering::AcqRel);
                self.thread_count.fetch_sub(1, Ordering::AcqRel);
                self.shutdown
                    .shutdown_fatal(format!("cannot spawn worker thread: {e}"));
                false
            }
        }
    }

    /// Thread-start rate limit
    fn allow_start(&self) -> bool {
        let mut window = self.window.lock();
        let now = Instant::now();

        if now.duration_since(window.start) >= self.config.throttle_period {
            window.start = now;
            window.count = 0;
        }

        if window.count >= self.config.throttle_limit {
            tracing::trace!(limit = self.config.throttle_limit, "thread start throttled");
            return false;
        }

        window.count += 1;
        true
    }

    fn worker_loop(self: Arc<Self>) {
        self.starting_count.fetch_sub(1, Ordering::AcqRel);
        self.consume_pending();
        tracing::trace!(threads = self.thread_count(), "worker started");

        loop {
            self.handle_tasks();

            if self.is_closed() || !self.park() {
                break;
            }
            self.consume_pending();
        }

        self.thread_count.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(threads = self.thread_count(), "worker exit");
        self.wake_launcher();
    }

    /// Drain the queues, accept work first
    fn handle_tasks(self: &Arc<Self>) {
        let mut retry = 0;

        while retry < self.config.task_retry_max && !self.is_closed() {
            match self.poll_task() {
                Some(item) => {
                    retry = 0;

                    self.active_count.fetch_add(1, Ordering::AcqRel);
                    if !self.resume_queue.is_empty() {
                        self.wake_resume_task(1);
                    }
                    item.run();
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    retry += 1;
                    thread::yield_now();
                }
            }
        }
    }

    fn poll_task(&self) -> Option<T> {
        self.accept_queue.pop().or_else(|| self.resume_queue.pop())
    }

    /// Wait for work. False on idle timeout or close.
    fn park(&self) -> bool {
        let mut parked = self.parked.lock();

        // Work pushed before we registered as waiting must not be missed
        if !self.accept_queue.is_empty() || !self.resume_queue.is_empty() {
            return true;
        }

        parked.waiting += 1;
        self.parked_count.store(parked.waiting, Ordering::Release);

        let deadline = Instant::now() + self.config.idle_timeout;
        let woken = loop {
            if parked.permits > 0 {
                parked.permits -= 1;
                break true;
            }
            if self.is_closed() {
                break false;
            }
            if self.park_cond.wait_until(&mut parked, deadline).timed_out() {
                if parked.permits > 0 {
                    parked.permits -= 1;
                    break true;
                }
                break false;
            }
        };

        parked.waiting -= 1;
        self.parked_count.store(parked.waiting, Ordering::Release);
        woken
    }

    fn unpark_one(&self) -> bool {
        let mut parked = self.parked.lock();
        if parked.waiting > parked.permits {
            parked.permits += 1;
            self.park_cond.notify_one();
            true
        } else {
            false
        }
    }

    // ========================================================================
    // Launcher thread
    // ========================================================================

    pub fn wake_launcher(&self) {
        let mut wake = self.launch_wake.lock();
        *wake = true;
        self.launch_cond.notify_one();
    }

    fn launcher_loop(self: Arc<Self>) {
        while !self.is_closed() {
            let mut backlog = false;

            if self.needs_acceptor() {
                backlog = true;
                let source = self.source.lock().as_ref().and_then(Weak::upgrade);
                match source {
                    Some(source) => {
                        source.start_acceptor();
                    }
                    None => backlog = false,
                }
            }

            if !self.accept_queue.is_empty() {
                backlog = true;
                if self.starting_count.load(Ordering::Acquire) == 0 && !self.unpark_one() {
                    self.spawn_worker();
                }
            }

            if !self.resume_queue.is_empty() {
                backlog = true;
                self.wake_resume_task(1);
            }

            let wait = if backlog {
                self.config.throttle_sleep
            } else {
                LAUNCHER_POLL
            };

            let mut wake = self.launch_wake.lock();
            if !*wake && !self.is_closed() {
                self.launch_cond.wait_for(&mut wake, wait);
            }
            *wake = false;
        }

        tracing::debug!(name = %self.config.name, "launcher exit");
    }

    fn needs_acceptor(&self) -> bool {
        let idle = self.idle_count.load(Ordering::Acquire) + self.accept_queue.len();
        idle < self.config.idle_min && self.thread_count() < self.config.thread_max
    }

    // ========================================================================
    // Acceptor bookkeeping
    // ========================================================================

    /// An acceptor is about to block in accept. False when enough are
    /// already waiting and this one should give up its link.
    pub fn child_idle_begin(&self) -> bool {
        let max = self.config.idle_max;
        self.idle_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// An acceptor returned from accept
    pub fn child_idle_end(&self) {
        let prev = self.idle_count.fetch_sub(1, Ordering::AcqRel);
        if prev <= self.config.idle_min {
            self.wake_launcher();
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Stop accepting submissions, release parked workers and abandon
    /// everything still queued. Running items are not interrupted.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let _parked = self.parked.lock();
            self.park_cond.notify_all();
        }
        self.wake_launcher();

        while let Some(item) = self.accept_queue.pop() {
            item.abandon();
        }
        while let Some(item) = self.resume_queue.pop() {
            item.abandon();
        }

        let handle = self.launcher_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Wait until every worker has exited or `timeout` passes
    pub fn join_workers(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.thread_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.thread_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn idle_count(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn starting_count(&self) -> usize {
        self.starting_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn pending_resume(&self) -> usize {
        self.pending_resume.load(Ordering::Acquire)
    }

    #[inline]
    pub fn parked_count(&self) -> usize {
        self.parked_count.load(Ordering::Acquire)
    }

    pub fn spawn_total(&self) -> u64 {
        self.spawn_total.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> (usize, usize) {
        (self.accept_queue.len(), self.resume_queue.len())
    }

    /// Every thread slot is taken and none is parked
    pub fn is_thread_max(&self) -> bool {
        self.thread_count() >= self.config.thread_max && self.parked_count() == 0
    }

    /// Three quarters of the thread budget is in use
    pub fn is_thread_high(&self) -> bool {
        self.thread_count() * 4 >= self.config.thread_max * 3
    }

    pub fn is_idle_low(&self) -> bool {
        self.idle_count() < self.config.idle_min
    }
}

impl<T: WorkItem> Drop for Launcher<T> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}
