//! Async (comet) request controller
//!
//! Returned by `LinkContext::to_comet`. Application code keeps it and calls
//! [`CometController::wake`] or [`CometController::complete`] from any
//! thread; the link is resumed on a pool worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tcplink_core::LinkId;

use crate::handler::CometHandler;
use crate::link::Link;

pub struct CometController {
    id: LinkId,
    link: Weak<Link>,
    handler: Mutex<Arc<dyn CometHandler>>,
    complete: AtomicBool,
    close_after: AtomicBool,
    timeout: AtomicBool,
    max_idle: Mutex<Option<Duration>>,
}

impl CometController {
    pub(crate) fn new(link: &Arc<Link>, handler: Arc<dyn CometHandler>) -> Self {
        Self {
            id: link.id(),
            link: Arc::downgrade(link),
            handler: Mutex::new(handler),
            complete: AtomicBool::new(false),
            close_after: AtomicBool::new(false),
            timeout: AtomicBool::new(false),
            max_idle: Mutex::new(None),
        }
    }

    pub fn link_id(&self) -> LinkId {
        self.id
    }

    /// Resume the link so its handler can write more. Returns whether this
    /// call scheduled the resume.
    pub fn wake(&self) -> bool {
        match self.link.upgrade() {
            Some(link) => link.request_wake_comet(),
            None => false,
        }
    }

    /// End the async cycle. The handler gets one more `handle_resume` to
    /// finish the response.
    pub fn complete(&self) -> bool {
        self.complete.store(true, Ordering::Release);
        self.wake()
    }

    /// Complete and close the connection instead of keeping it alive
    pub fn complete_and_close(&self) -> bool {
        self.close_after.store(true, Ordering::Release);
        self.complete()
    }

    #[inline]
    pub fn is_complete_requested(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        self.timeout.load(Ordering::Acquire)
    }

    /// Override the port's suspend deadline for this cycle
    pub fn set_max_idle(&self, max_idle: Duration) {
        *self.max_idle.lock() = Some(max_idle);
    }

    pub fn max_idle(&self) -> Option<Duration> {
        *self.max_idle.lock()
    }

    pub(crate) fn is_close_requested(&self) -> bool {
        self.close_after.load(Ordering::Acquire)
    }

    pub(crate) fn mark_timeout(&self) {
        self.timeout.store(true, Ordering::Release);
    }

    pub(crate) fn replace_handler(&self, handler: Arc<dyn CometHandler>) {
        *self.handler.lock() = handler;
    }

    pub(crate) fn on_timeout(&self) {
        let handler = Arc::clone(&self.handler.lock());
        handler.on_timeout();
    }

    pub(crate) fn on_complete(&self) {
        let handler = Arc::clone(&self.handler.lock());
        handler.on_complete();
    }
}

impl std::fmt::Debug for CometController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CometController")
            .field("link", &self.id)
            .field("complete", &self.is_complete_requested())
            .field("timeout", &self.is_timeout())
            .finish()
    }
}
