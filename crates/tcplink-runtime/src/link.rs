//! A pooled connection slot
//!
//! A `Link` outlives the connections it serves: after a connection closes
//! it goes back to the port's idle pool and is reused for the next accept,
//! keeping its id and its [`RequestHandler`].
//!
//! ```text
//!   Accept task ─► accept() ─► handle_requests ─┬─► RequestComplete ─► close, accept again
//!                                               ├─► KeepaliveSelect ─► detach (selector holds it)
//!                                               ├─► Async           ─► detach (reaper / wake holds it)
//!                                               └─► Duplex          ─► duplex loop on same worker
//!
//!   selector ready ──► request_wake_keepalive ──► Keepalive task
//!   comet wake()   ──► request_wake_comet     ──► CometResume task
//! ```
//!
//! # Ownership
//!
//! At any moment the link is either bound to exactly one worker (which
//! holds its `Session`: handler and socket) or detached, with the session
//! parked inside the link. The `RequestStateCell` decides who may bind it
//! next; `LinkState` is only touched by the bound worker.

use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tcplink_core::{
    DestroyOutcome, IllegalTransition, LinkError, LinkEvent, LinkId, LinkResult, LinkState,
    Machine, RequestState, RequestStateCell, Slot, TaskKind, TaskResult,
};

use crate::comet::CometController;
use crate::handler::{
    CometHandler, DuplexContext, DuplexHandler, DuplexStatus, LinkContext, RequestHandler,
};
use crate::launcher::WorkItem;
use crate::port::{PortShared, ReadProbe};
use crate::socket::{self, LinkSocket};
use crate::task::Task;

/// Per-connection timestamps. Cleared when the link returns to the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    pub connection_start: Option<Instant>,
    pub request_start: Option<Instant>,
    /// Start of the current keepalive or comet wait
    pub idle_start: Option<Instant>,
    /// Deadline of the current keepalive or comet wait
    pub idle_expire: Option<Instant>,
}

/// What the bound worker holds while it runs the link
pub(crate) struct Session {
    pub(crate) handler: Box<dyn RequestHandler>,
    pub(crate) socket: Option<LinkSocket>,
    pub(crate) duplex: Option<Box<dyn DuplexHandler>>,
}

struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn not_connected() -> LinkError {
    LinkError::Io(io::Error::from(io::ErrorKind::NotConnected))
}

pub struct Link {
    id: LinkId,
    port: Arc<PortShared>,

    request_state: RequestStateCell,
    state: Mutex<LinkState>,
    timing: Mutex<Timing>,

    /// Worker currently bound to the link
    owner: Mutex<Option<ThreadId>>,
    session: Mutex<Option<Session>>,

    /// Duplicate of the connection's fd for shutdown and readiness probes
    control: Mutex<Option<TcpStream>>,
    comet: Mutex<Option<Arc<CometController>>>,
    dispatching: AtomicBool,
}

impl Link {
    pub(crate) fn new(id: LinkId, port: Arc<PortShared>, handler: Box<dyn RequestHandler>) -> Arc<Self> {
        Arc::new(Self {
            id,
            port,
            request_state: RequestStateCell::new(),
            state: Mutex::new(LinkState::Init),
            timing: Mutex::new(Timing::default()),
            owner: Mutex::new(None),
            session: Mutex::new(Some(Session {
                handler,
                socket: None,
                duplex: None,
            })),
            control: Mutex::new(None),
            comet: Mutex::new(None),
            dispatching: AtomicBool::new(false),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn request_state(&self) -> RequestState {
        self.request_state.get()
    }

    pub fn timing(&self) -> Timing {
        *self.timing.lock()
    }

    pub fn comet(&self) -> Option<Arc<CometController>> {
        self.comet.lock().clone()
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    fn is_comet_pending(&self) -> bool {
        self.comet
            .lock()
            .as_ref()
            .is_some_and(|c| !c.is_complete_requested())
    }

    fn is_idle_expired(&self) -> bool {
        self.timing()
            .idle_expire
            .is_some_and(|expire| expire <= Instant::now())
    }

    pub(crate) fn is_read_eof(&self) -> bool {
        self.control.lock().as_ref().is_some_and(socket::is_read_eof)
    }

    pub(crate) fn control_stream(&self) -> Option<TcpStream> {
        self.control.lock().as_ref().and_then(|s| s.try_clone().ok())
    }

    /// Shut the socket down under whoever is blocked on it
    pub(crate) fn force_shutdown(&self) {
        if let Some(stream) = self.control.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Pool reuse. Caller holds the only reference that can dispatch it.
    pub(crate) fn reset_for_reuse(&self) {
        *self.state.lock() = LinkState::Init;
        *self.timing.lock() = Timing::default();
        *self.comet.lock() = None;
        self.dispatching.store(false, Ordering::Release);
        self.request_state.reset();
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Apply a phase transition and its effects on the port-wide keepalive
    /// budget and suspend set, all under the state lock.
    fn transition(self: &Arc<Self>, event: LinkEvent) -> LinkResult<LinkState> {
        let mut state = self.state.lock();

        let t = state.next(event).map_err(|e| {
            tracing::error!(link = %self.id, error = %e, "illegal link transition");
            e
        })?;

        match t.keepalive {
            Slot::Acquire => self.port.keepalive_allocate(),
            Slot::Release => self.port.keepalive_free(),
            Slot::Keep => {}
        }
        match t.suspend {
            Slot::Acquire => self.port.comet_suspend(self),
            Slot::Release => self.port.comet_detach(self.id),
            Slot::Keep => {}
        }

        *state = t.next;
        Ok(t.next)
    }

    pub(crate) fn kill_keepalive_owned(self: &Arc<Self>, reason: &str) {
        if self.state().is_keepalive_allocated() {
            tracing::trace!(link = %self.id, reason, "keepalive disabled");
        }
        let _ = self.transition(LinkEvent::KillKeepalive);
    }

    /// Disable keepalive for the current cycle. Only the bound worker may
    /// call this.
    pub fn kill_keepalive(self: &Arc<Self>, reason: &str) -> LinkResult<()> {
        if !self.is_owned_by_current_thread() {
            return Err(LinkError::NotOwner);
        }
        self.kill_keepalive_owned(reason);
        Ok(())
    }

    // ========================================================================
    // Claims and wakers
    // ========================================================================

    /// Claim an idle link for a new connection
    pub(crate) fn request_accept(&self) -> bool {
        self.request_state.to_accept()
    }

    /// Selector saw data on a kept-alive connection
    pub fn request_wake_keepalive(self: &Arc<Self>) -> bool {
        if self.request_state.to_wake_keepalive() {
            self.schedule(TaskKind::Keepalive);
            true
        } else {
            false
        }
    }

    /// Selector deadline for a kept-alive connection passed
    pub fn request_timeout_keepalive(self: &Arc<Self>) -> bool {
        if self.request_state.to_wake_keepalive() {
            self.schedule(TaskKind::KeepaliveTimeout);
            true
        } else {
            false
        }
    }

    pub fn request_wake_comet(self: &Arc<Self>) -> bool {
        if self.request_state.to_async_wake() {
            self.schedule(TaskKind::CometResume);
            true
        } else {
            false
        }
    }

    /// Reaper: suspend deadline passed
    pub(crate) fn request_comet_timeout(self: &Arc<Self>) -> bool {
        if let Some(comet) = self.comet() {
            comet.mark_timeout();
        }
        self.request_wake_comet()
    }

    /// Reaper: peer went away while suspended
    pub(crate) fn request_comet_close(self: &Arc<Self>) -> bool {
        match self.comet() {
            Some(comet) => comet.complete_and_close(),
            None => self.request_wake_comet(),
        }
    }

    /// Tear the link down from any thread. A bound worker finishes the
    /// teardown itself when it returns.
    pub fn request_destroy(self: &Arc<Self>) {
        match self.request_state.to_destroy() {
            DestroyOutcome::AlreadyDestroyed => {}
            DestroyOutcome::Owned => self.force_shutdown(),
            DestroyOutcome::Detached => {
                if let Some(selector) = self.port.selector() {
                    selector.close_keepalive(self);
                }
                self.force_shutdown();
                self.schedule(TaskKind::Destroy);
            }
        }
    }

    fn schedule(self: &Arc<Self>, kind: TaskKind) {
        let task = Task::new(kind, Arc::clone(self));
        if let Err(task) = self.port.launcher().submit_resume(task) {
            tracing::warn!(link = %self.id, task = %kind, "cannot schedule task, destroying link");
            task.abandon();
        }
    }

    /// A queued task for this link was dropped; whoever dropped it owns
    /// the teardown.
    pub(crate) fn abandon(self: &Arc<Self>, kind: TaskKind) {
        tracing::debug!(link = %self.id, task = %kind, "task abandoned");
        self.request_state.to_destroy();
        self.destroy_detached();
    }

    // ========================================================================
    // Thread binding
    // ========================================================================

    /// Bind the calling worker and hand it the session
    pub(crate) fn start_thread(&self) -> Option<Session> {
        let mut owner = self.owner.lock();
        if let Some(current) = *owner {
            tracing::error!(link = %self.id, owner = ?current, "link already bound to a worker");
            return None;
        }

        let Some(mut session) = self.session.lock().take() else {
            tracing::error!(link = %self.id, "link session missing");
            return None;
        };

        *owner = Some(thread::current().id());
        drop(owner);

        session.handler.on_attach_thread();
        Some(session)
    }

    fn release(&self, session: Session) {
        let mut owner = self.owner.lock();
        *self.session.lock() = Some(session);
        *owner = None;
    }

    /// Unbind the worker and act on the task's result. Runs exactly once
    /// per task.
    pub(crate) fn finish_thread(self: &Arc<Self>, mut session: Session, result: TaskResult) {
        session.handler.on_detach_thread();

        if self.request_state.is_destroyed() {
            self.destroy(&mut session);
            self.release(session);
            return;
        }

        // The session goes back before the detach CAS: a wake that lands
        // right after it may bind another worker immediately.
        match result {
            TaskResult::KeepaliveSelect => {
                self.release(session);
                self.detach(self.request_state.to_keepalive_suspend(), TaskKind::Keepalive);
                return;
            }
            TaskResult::Async => {
                self.release(session);
                self.detach(self.request_state.to_async_suspend(), TaskKind::CometResume);
                return;
            }
            _ => {}
        }

        self.close_connection(&mut session);

        match self.request_state.to_idle() {
            Ok(true) => {
                let _ = self.transition(LinkEvent::ToInit);
                self.release(session);
                self.port.free(Arc::clone(self));
            }
            Ok(false) => {
                self.destroy(&mut session);
                self.release(session);
            }
            Err(e) => {
                tracing::error!(link = %self.id, error = %e, "cannot return link to pool");
                self.request_state.to_destroy();
                self.destroy(&mut session);
                self.release(session);
            }
        }
    }

    fn detach(self: &Arc<Self>, suspended: Result<bool, IllegalTransition>, resume: TaskKind) {
        match suspended {
            Ok(true) => {}
            Ok(false) if self.request_state.is_destroyed() => self.destroy_detached(),
            // Woken before we let go
            Ok(false) => self.schedule(resume),
            Err(e) => {
                tracing::error!(link = %self.id, error = %e, "cannot detach link");
                self.request_state.to_destroy();
                self.destroy_detached();
            }
        }
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    pub(crate) fn handle_accept_task(self: &Arc<Self>, s: &mut Session) -> TaskResult {
        let mut result = TaskResult::RequestComplete;

        while matches!(result, TaskResult::RequestComplete | TaskResult::Closed) {
            if self.port.is_closed() || self.request_state.is_destroyed() {
                return TaskResult::Exit;
            }
            if self.transition(LinkEvent::ToAccept).is_err() {
                return TaskResult::Exit;
            }

            match self.accept(s) {
                Ok(true) => {}
                Ok(false) => return TaskResult::Exit,
                Err(e) => {
                    self.log_error(&e);
                    return TaskResult::Exit;
                }
            }

            if let Err(e) = self.start_connection(s) {
                self.log_error(&e);
                self.close_connection(s);
                result = TaskResult::Closed;
                continue;
            }

            result = self.handle_requests(s, TaskKind::Accept);
        }

        result
    }

    pub(crate) fn handle_keepalive_task(self: &Arc<Self>, s: &mut Session) -> TaskResult {
        match self.request_state.to_keepalive_resume() {
            Ok(true) => {}
            Ok(false) => return TaskResult::Exit,
            Err(e) => {
                self.log_error(&LinkError::from(e));
                return TaskResult::Exit;
            }
        }

        let Some(socket) = s.socket.as_mut() else {
            return TaskResult::Exit;
        };

        match socket.fill_with_timeout(Duration::ZERO) {
            Ok(0) => {
                tracing::trace!(link = %self.id, "peer closed during keepalive");
                self.kill_keepalive_owned("peer closed");
                self.close_connection(s);
                self.handle_accept_task(s)
            }
            Ok(_) => self.handle_requests(s, TaskKind::Keepalive),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if self.is_idle_expired() {
                    return self.keepalive_timeout(s);
                }
                // Woken without data: wait again until the same deadline
                let expire = self.timing().idle_expire;
                let result = self.process_keepalive(s, expire).and_then(|result| {
                    if result == TaskResult::RequestComplete {
                        self.handle_requests_loop(s, false)
                    } else {
                        Ok(result)
                    }
                });
                self.complete_requests(s, TaskKind::Keepalive, result)
            }
            Err(e) => {
                self.log_error(&LinkError::from_io(e));
                self.close_connection(s);
                TaskResult::Exit
            }
        }
    }

    pub(crate) fn handle_keepalive_timeout_task(self: &Arc<Self>, s: &mut Session) -> TaskResult {
        match self.request_state.to_keepalive_resume() {
            Ok(true) => self.keepalive_timeout(s),
            Ok(false) => TaskResult::Exit,
            Err(e) => {
                self.log_error(&LinkError::from(e));
                TaskResult::Exit
            }
        }
    }

    pub(crate) fn handle_resume_task(self: &Arc<Self>, s: &mut Session) -> TaskResult {
        if self.request_state.is_destroyed() {
            return TaskResult::Exit;
        }
        let result = self.handle_resume(s).and_then(|result| {
            if result == TaskResult::RequestComplete && self.state().is_keepalive_allocated() {
                self.handle_requests_loop(s, true)
            } else {
                Ok(result)
            }
        });
        self.complete_requests(s, TaskKind::CometResume, result)
    }

    pub(crate) fn handle_duplex_task(self: &Arc<Self>, s: &mut Session) -> TaskResult {
        let Some(mut handler) = s.duplex.take() else {
            self.close_connection(s);
            return TaskResult::Closed;
        };

        if let Err(e) = self.duplex_loop(s, handler.as_mut()) {
            self.log_error(&e);
        }

        handler.on_close();
        self.close_connection(s);
        TaskResult::Closed
    }

    /// Cleanup after a handler panicked mid-task
    pub(crate) fn close_after_panic(self: &Arc<Self>, s: &mut Session) {
        self.kill_keepalive_owned("handler panic");
        self.close_connection(s);
    }

    fn keepalive_timeout(self: &Arc<Self>, s: &mut Session) -> TaskResult {
        tracing::debug!(link = %self.id, "keepalive timeout");
        self.kill_keepalive_owned("keepalive timeout");
        self.close_connection(s);
        self.handle_accept_task(s)
    }

    // ========================================================================
    // Accept
    // ========================================================================

    fn accept(self: &Arc<Self>, s: &mut Session) -> LinkResult<bool> {
        let launcher = self.port.launcher();
        if !launcher.child_idle_begin() {
            return Ok(false);
        }

        let accepted = self.port.accept_connection();
        launcher.child_idle_end();

        match accepted? {
            Some(socket) => {
                *self.control.lock() = socket.try_clone_stream().ok();
                s.socket = Some(socket);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn start_connection(self: &Arc<Self>, s: &mut Session) -> LinkResult<()> {
        *self.timing.lock() = Timing {
            connection_start: Some(Instant::now()),
            ..Timing::default()
        };

        let Session {
            handler,
            socket,
            duplex,
        } = s;
        let socket = socket.as_mut().ok_or_else(not_connected)?;

        tracing::trace!(link = %self.id, peer = %socket.peer_addr(), "connection start");
        let mut cx = LinkContext::new(self, socket, duplex);
        handler.on_start_connection(&mut cx)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn handle_requests(self: &Arc<Self>, s: &mut Session, kind: TaskKind) -> TaskResult {
        let wait_first = kind == TaskKind::Keepalive && !self.state().is_keepalive();
        let result = self.handle_requests_loop(s, wait_first);
        self.complete_requests(s, kind, result)
    }

    fn complete_requests(
        self: &Arc<Self>,
        s: &mut Session,
        kind: TaskKind,
        result: LinkResult<TaskResult>,
    ) -> TaskResult {
        let result = result.unwrap_or_else(|e| {
            self.log_error(&e);
            TaskResult::Exit
        });

        match result {
            TaskResult::KeepaliveSelect | TaskResult::Async | TaskResult::Duplex => result,
            TaskResult::RequestComplete | TaskResult::Closed if kind != TaskKind::Accept => {
                self.close_connection(s);
                self.handle_accept_task(s)
            }
            _ => {
                self.close_connection(s);
                result
            }
        }
    }

    fn handle_requests_loop(self: &Arc<Self>, s: &mut Session, wait_first: bool) -> LinkResult<TaskResult> {
        let mut wait = wait_first;

        loop {
            if self.port.is_closed() {
                return Ok(TaskResult::Exit);
            }

            if wait {
                let result = self.process_keepalive(s, None)?;
                if result != TaskResult::RequestComplete {
                    return Ok(result);
                }
            }

            let result = self.handle_request(s)?;
            if result != TaskResult::RequestComplete || !self.state().is_keepalive_allocated() {
                return Ok(result);
            }

            wait = true;
        }
    }

    fn handle_request(self: &Arc<Self>, s: &mut Session) -> LinkResult<TaskResult> {
        self.port.stats().add_request();
        self.dispatch_request(s)?;

        let state = self.state();
        if state.is_duplex() {
            return Ok(TaskResult::Duplex);
        }

        if let Some(socket) = s.socket.as_mut() {
            socket.flush().map_err(LinkError::from_io)?;
        }

        if state.is_comet() {
            if self.is_comet_pending() && self.to_suspend()? {
                return Ok(TaskResult::Async);
            }
            // Completed or woken before the worker could let go
            return self.handle_resume(s);
        }

        Ok(TaskResult::RequestComplete)
    }

    fn dispatch_request(self: &Arc<Self>, s: &mut Session) -> LinkResult<()> {
        if self.dispatching.swap(true, Ordering::AcqRel) {
            tracing::error!(link = %self.id, "concurrent dispatch on one link");
            return Err(LinkError::IllegalTransition(IllegalTransition {
                machine: Machine::Link,
                from: self.state().name(),
                event: "dispatch",
            }));
        }
        let _guard = DispatchGuard(&self.dispatching);

        let connection_start = {
            let mut timing = self.timing.lock();
            timing.request_start = Some(Instant::now());
            timing.idle_start = None;
            timing.idle_expire = None;
            timing.connection_start
        };

        let allowed = self.port.is_keepalive_allowed(connection_start);
        self.transition(LinkEvent::ToActive {
            keepalive_allowed: allowed,
        })?;

        let Session {
            handler,
            socket,
            duplex,
        } = s;
        let socket = socket.as_mut().ok_or_else(not_connected)?;

        let result = {
            let mut cx = LinkContext::new(self, socket, duplex);
            handler.handle_request(&mut cx)
        };
        self.timing.lock().request_start = None;

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.kill_keepalive_owned("handler closed");
                Ok(())
            }
            Err(e) if e.is_client_disconnect() || e.is_fatal() => Err(e),
            Err(e) => {
                tracing::debug!(link = %self.id, error = %e, "request handler failed");
                self.kill_keepalive_owned("handler error");
                Ok(())
            }
        }
    }

    // ========================================================================
    // Keepalive
    // ========================================================================

    /// Wait for the next request, on the thread and then the selector.
    /// `expire` carries the deadline over from an earlier wait.
    fn process_keepalive(
        self: &Arc<Self>,
        s: &mut Session,
        expire: Option<Instant>,
    ) -> LinkResult<TaskResult> {
        let Some(socket) = s.socket.as_mut() else {
            return Ok(TaskResult::Exit);
        };
        if socket.available() > 0 {
            return Ok(TaskResult::RequestComplete);
        }

        let now = Instant::now();
        let expire = {
            let mut timing = self.timing.lock();
            let expire = match expire {
                Some(expire) => expire,
                None => {
                    timing.idle_start = Some(now);
                    now + self.port.config().keepalive_timeout
                }
            };
            timing.idle_expire = Some(expire);
            expire
        };

        let selector = self.port.selector();

        // Short thread wait first; most clients send the next request quickly
        if selector.is_some() {
            match self.port.keepalive_thread_read(socket)? {
                ReadProbe::Data(_) => return Ok(TaskResult::RequestComplete),
                ReadProbe::Eof => {
                    self.kill_keepalive_owned("peer closed");
                    return Ok(TaskResult::Closed);
                }
                ReadProbe::Timeout => {}
            }
        }

        self.port.stats().add_keepalive();
        self.transition(LinkEvent::ToKeepalive)?;

        if let Some(selector) = selector {
            if !self.request_state.to_keepalive_start()? {
                return Ok(TaskResult::Exit);
            }
            self.transition(LinkEvent::ToKeepaliveSelect)?;

            if selector.keepalive(self) {
                self.port.stats().add_select_keepalive();
                return Ok(TaskResult::KeepaliveSelect);
            }

            tracing::warn!(link = %self.id, "selector refused keepalive, waiting on thread");
            self.request_state.to_keepalive_cancel()?;
        }

        self.thread_keepalive(s, expire)
    }

    fn thread_keepalive(self: &Arc<Self>, s: &mut Session, expire: Instant) -> LinkResult<TaskResult> {
        let deadline = expire.min(Instant::now() + self.port.config().socket_timeout);
        let socket = s.socket.as_mut().ok_or_else(not_connected)?;

        loop {
            let now = Instant::now();
            if now >= deadline || self.port.is_closed() {
                break;
            }

            match socket.fill_with_timeout(deadline - now) {
                Ok(0) => break,
                Ok(_) => return Ok(TaskResult::RequestComplete),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(LinkError::from_io(e)),
            }
        }

        self.kill_keepalive_owned("keepalive wait ended");
        Ok(TaskResult::Closed)
    }

    // ========================================================================
    // Comet
    // ========================================================================

    pub(crate) fn to_comet(self: &Arc<Self>, handler: Arc<dyn CometHandler>) -> LinkResult<Arc<CometController>> {
        if !self.is_owned_by_current_thread() {
            return Err(LinkError::NotOwner);
        }

        let existing = self.comet();
        if existing.as_ref().is_some_and(|c| c.is_complete_requested()) {
            return Err(LinkError::CometAfterComplete);
        }

        // Only the owner moves the link state, so the check stays valid
        self.state().next(LinkEvent::ToComet)?;
        if !self.request_state.to_async_start()? {
            return Err(not_connected());
        }
        self.transition(LinkEvent::ToComet)?;

        let comet = match existing {
            Some(comet) => {
                comet.replace_handler(handler);
                comet
            }
            None => {
                let comet = Arc::new(CometController::new(self, handler));
                *self.comet.lock() = Some(Arc::clone(&comet));
                comet
            }
        };
        Ok(comet)
    }

    /// Enter COMET_SUSPEND. `false` when a wake already arrived and the
    /// worker must resume instead of detaching.
    fn to_suspend(self: &Arc<Self>) -> LinkResult<bool> {
        let max_idle = self
            .comet()
            .and_then(|c| c.max_idle())
            .unwrap_or(self.port.config().suspend_time_max);

        let now = Instant::now();
        {
            let mut timing = self.timing.lock();
            timing.idle_start = Some(now);
            timing.idle_expire = Some(now + max_idle);
        }

        self.transition(LinkEvent::ToCometSuspend)?;
        Ok(self.request_state.get() != RequestState::AsyncWake)
    }

    fn handle_resume(self: &Arc<Self>, s: &mut Session) -> LinkResult<TaskResult> {
        loop {
            if self.request_state.is_destroyed() {
                return Ok(TaskResult::Exit);
            }
            self.request_state.to_async_resume()?;
            self.transition(LinkEvent::ToCometResume)?;

            let comet = self.comet();

            if let Some(comet) = &comet {
                if comet.is_timeout() || (self.is_idle_expired() && !comet.is_complete_requested()) {
                    self.port.stats().add_comet_timeout();
                    tracing::debug!(link = %self.id, "comet timeout");
                    comet.on_timeout();
                    self.kill_keepalive_owned("comet timeout");
                    self.end_comet()?;
                    return Ok(TaskResult::Closed);
                }
            }

            let close_after = comet.as_ref().is_some_and(|c| c.is_close_requested());

            let result = {
                let Session {
                    handler,
                    socket,
                    duplex,
                } = &mut *s;
                let socket = socket.as_mut().ok_or_else(not_connected)?;
                let mut cx = LinkContext::new(self, socket, duplex);
                handler.handle_resume(&mut cx)
            };

            match result {
                Ok(true) => {}
                Ok(false) => self.kill_keepalive_owned("handler closed"),
                Err(e) if e.is_client_disconnect() || e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::debug!(link = %self.id, error = %e, "resume handler failed");
                    self.kill_keepalive_owned("handler error");
                }
            }
            if close_after {
                self.kill_keepalive_owned("comet closed");
            }

            if let Some(socket) = s.socket.as_mut() {
                socket.flush().map_err(LinkError::from_io)?;
            }

            let state = self.state();
            if state.is_duplex() {
                self.end_comet()?;
                return Ok(TaskResult::Duplex);
            }

            if state.is_comet() {
                // Handler re-entered comet
                if self.is_comet_pending() && self.to_suspend()? {
                    return Ok(TaskResult::Async);
                }
                continue;
            }

            // The caller keeps serving the connection if keepalive survived
            self.end_comet()?;
            return Ok(TaskResult::RequestComplete);
        }
    }

    fn end_comet(&self) -> LinkResult<()> {
        if let Some(comet) = self.comet.lock().take() {
            comet.on_complete();
        }
        {
            let mut timing = self.timing.lock();
            timing.idle_start = None;
            timing.idle_expire = None;
        }
        self.request_state.to_async_complete()?;
        Ok(())
    }

    // ========================================================================
    // Duplex
    // ========================================================================

    pub(crate) fn start_duplex(
        self: &Arc<Self>,
        socket: &mut LinkSocket,
        slot: &mut Option<Box<dyn DuplexHandler>>,
        mut handler: Box<dyn DuplexHandler>,
    ) -> LinkResult<()> {
        if !self.is_owned_by_current_thread() {
            return Err(LinkError::NotOwner);
        }

        self.transition(LinkEvent::ToDuplex)?;

        let mut cx = DuplexContext { link: self, socket };
        handler.on_start(&mut cx)?;

        *slot = Some(handler);
        Ok(())
    }

    fn duplex_loop(self: &Arc<Self>, s: &mut Session, handler: &mut dyn DuplexHandler) -> LinkResult<()> {
        let timeout = self.port.config().socket_timeout;

        loop {
            if self.port.is_closed() || self.request_state.is_destroyed() {
                return Ok(());
            }
            let Some(socket) = s.socket.as_mut() else {
                return Ok(());
            };

            match socket.fill_with_timeout(timeout) {
                Ok(0) => {
                    tracing::trace!(link = %self.id, "duplex peer closed");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    tracing::debug!(link = %self.id, "duplex read timeout");
                    return Ok(());
                }
                Err(e) => return Err(LinkError::from_io(e)),
            }

            self.transition(LinkEvent::ToDuplexActive)?;

            let before = socket.position();
            let status = {
                let mut cx = DuplexContext { link: self, socket };
                handler.service_read(&mut cx)?
            };
            socket.flush().map_err(LinkError::from_io)?;

            if status == DuplexStatus::Complete {
                return Ok(());
            }
            if socket.position() == before {
                tracing::warn!(link = %self.id, "duplex handler consumed no data, closing");
                self.port.stats().add_duplex_stall();
                return Ok(());
            }

            self.transition(LinkEvent::ToDuplex)?;
        }
    }

    // ========================================================================
    // Close / destroy
    // ========================================================================

    fn close_connection(self: &Arc<Self>, s: &mut Session) {
        if let Some(comet) = self.comet.lock().take() {
            comet.on_complete();
        }
        if let Some(mut duplex) = s.duplex.take() {
            duplex.on_close();
        }

        *self.control.lock() = None;

        if let Some(socket) = s.socket.take() {
            s.handler.on_close_connection();
            self.port
                .stats()
                .add_bytes(socket.read_total(), socket.write_total());
            socket.shutdown();
            self.port.close_socket();
            tracing::trace!(link = %self.id, peer = %socket.peer_addr(), "connection closed");
        }

        *self.timing.lock() = Timing::default();
        let _ = self.transition(LinkEvent::ToClosed);
    }

    fn destroy(self: &Arc<Self>, s: &mut Session) {
        self.request_state.to_destroy();
        if let Some(selector) = self.port.selector() {
            selector.close_keepalive(self);
        }
        self.close_connection(s);
        let _ = self.transition(LinkEvent::ToDestroy);
        self.port.connection_closed(self.id);
        tracing::debug!(link = %self.id, "link destroyed");
    }

    /// Destroy a link no worker is bound to
    fn destroy_detached(self: &Arc<Self>) {
        let session = self.session.lock().take();
        match session {
            Some(mut session) => {
                self.destroy(&mut session);
                *self.session.lock() = Some(session);
            }
            // A worker holds it and will see DESTROY on the way out
            None => {
                self.request_state.to_destroy();
                self.force_shutdown();
            }
        }
    }

    fn log_error(&self, err: &LinkError) {
        if err.is_client_disconnect() {
            self.port.stats().add_client_disconnect();
            tracing::debug!(link = %self.id, error = %err, "client disconnect");
        } else if err.is_fatal() {
            tracing::error!(link = %self.id, error = %err, "fatal link error");
            self.port.shutdown().shutdown_fatal(err.to_string());
        } else if matches!(err, LinkError::IllegalTransition(_)) {
            tracing::error!(link = %self.id, error = %err, "link state error");
        } else {
            tracing::debug!(link = %self.id, error = %err, "link error");
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("request_state", &self.request_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Protocol;
    use crate::port::Port;
    use tcplink_core::PortConfig;

    struct Silent;

    impl RequestHandler for Silent {
        fn handle_request(&mut self, _cx: &mut LinkContext<'_>) -> LinkResult<bool> {
            Ok(true)
        }
    }

    struct Quiet;

    impl CometHandler for Quiet {}

    struct SilentProtocol;

    impl Protocol for SilentProtocol {
        fn create_handler(&self, _link: LinkId) -> Box<dyn RequestHandler> {
            Box::new(Silent)
        }
    }

    fn port() -> Port {
        Port::new(PortConfig::new().bind("127.0.0.1:0").unwrap(), SilentProtocol).unwrap()
    }

    #[test]
    fn test_pool_reuse_resets_state() {
        let port = port();
        let shared = port.shared();

        let link = shared.allocate_link().unwrap();
        assert!(link.request_accept());
        link.transition(LinkEvent::ToAccept).unwrap();
        {
            let mut timing = link.timing.lock();
            timing.connection_start = Some(Instant::now());
            timing.idle_expire = Some(Instant::now());
        }

        // What finish_thread does after a connection ends
        let mut session = link.start_thread().unwrap();
        link.close_connection(&mut session);
        assert_eq!(link.request_state.to_idle(), Ok(true));
        link.transition(LinkEvent::ToInit).unwrap();
        link.release(session);
        shared.free(Arc::clone(&link));
        assert_eq!(port.idle_pool_count(), 1);

        let reused = shared.allocate_link().unwrap();
        assert!(Arc::ptr_eq(&link, &reused));
        assert_eq!(reused.state(), LinkState::Init);
        assert_eq!(reused.request_state(), RequestState::Init);
        assert_eq!(reused.timing(), Timing::default());
        assert!(reused.comet().is_none());
    }

    #[test]
    fn test_bind_is_exclusive() {
        let port = port();
        let link = port.shared().allocate_link().unwrap();

        let session = link.start_thread().unwrap();
        assert!(link.is_owned_by_current_thread());
        assert!(link.start_thread().is_none());

        link.release(session);
        assert!(!link.is_owned_by_current_thread());
        assert!(link.start_thread().is_some());
    }

    #[test]
    fn test_kill_keepalive_requires_owner() {
        let port = port();
        let link = port.shared().allocate_link().unwrap();
        assert!(matches!(link.kill_keepalive("test"), Err(LinkError::NotOwner)));
    }

    #[test]
    fn test_destroy_detached_link() {
        let port = port();
        let link = port.shared().allocate_link().unwrap();
        assert_eq!(port.active_connection_count(), 1);

        // Launcher is not running, so the destroy task cannot be queued and
        // the link is torn down inline
        port.shared().launcher().close();
        link.request_destroy();

        assert_eq!(link.request_state(), RequestState::Destroy);
        assert_eq!(link.state(), LinkState::Destroyed);
        assert_eq!(port.active_connection_count(), 0);
    }

    #[test]
    fn test_comet_outside_request_leaves_state() {
        let port = port();
        let link = port.shared().allocate_link().unwrap();
        assert!(link.request_accept());
        link.transition(LinkEvent::ToAccept).unwrap();

        let session = link.start_thread().unwrap();
        let err = link.to_comet(Arc::new(Quiet)).unwrap_err();
        assert!(matches!(err, LinkError::IllegalTransition(_)));
        assert_eq!(link.state(), LinkState::Accept);
        assert_eq!(link.request_state(), RequestState::Request);
        assert!(link.comet().is_none());
        link.release(session);
    }

    #[test]
    fn test_keepalive_budget_follows_state() {
        let port = port();
        let link = port.shared().allocate_link().unwrap();

        link.transition(LinkEvent::ToAccept).unwrap();
        link.transition(LinkEvent::ToActive { keepalive_allowed: true }).unwrap();
        assert_eq!(port.keepalive_connection_count(), 1);

        link.transition(LinkEvent::KillKeepalive).unwrap();
        assert_eq!(port.keepalive_connection_count(), 0);

        link.transition(LinkEvent::ToActive { keepalive_allowed: true }).unwrap();
        link.transition(LinkEvent::ToComet).unwrap();
        link.transition(LinkEvent::ToCometSuspend).unwrap();
        assert_eq!(port.comet_idle_count(), 1);

        link.transition(LinkEvent::ToClosed).unwrap();
        assert_eq!(port.keepalive_connection_count(), 0);
        assert_eq!(port.comet_idle_count(), 0);
    }
}
