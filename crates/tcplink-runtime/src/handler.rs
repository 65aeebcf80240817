//! Handler contracts and the context passed into them
//!
//! The engine never parses payload bytes. A [`Protocol`] creates one
//! [`RequestHandler`] per link; the handler is reused across every
//! connection the link serves. Each callback receives an explicit context
//! instead of reaching for thread-local "current request" state.
//!
//! ```text
//!   Protocol::create_handler ──► RequestHandler (one per Link)
//!                                   │ handle_request(cx) ──► cx.to_comet(..)   ─► CometController
//!                                   │                    └─► cx.start_duplex(..) ─► DuplexHandler
//!                                   └ handle_resume(cx)
//! ```

use std::sync::Arc;
use std::time::Instant;

use tcplink_core::{LinkId, LinkResult};

use crate::comet::CometController;
use crate::link::Link;
use crate::socket::LinkSocket;

/// Factory for per-link handlers
pub trait Protocol: Send + Sync + 'static {
    fn name(&self) -> &str {
        "tcp"
    }

    fn create_handler(&self, link: LinkId) -> Box<dyn RequestHandler>;
}

/// Byte-level request processing for one link.
///
/// **Contract:**
/// - Called only from the worker bound to the link; never concurrently.
/// - `handle_request` returns whether the connection may be kept alive.
///   An `Err` disables keepalive for this cycle and closes the connection;
///   the worker survives.
/// - `handle_resume` runs after a comet wake. To keep waiting it must call
///   `cx.to_comet` again; otherwise the async cycle ends.
pub trait RequestHandler: Send {
    fn on_start_connection(&mut self, _cx: &mut LinkContext<'_>) -> LinkResult<()> {
        Ok(())
    }

    fn handle_request(&mut self, cx: &mut LinkContext<'_>) -> LinkResult<bool>;

    fn handle_resume(&mut self, _cx: &mut LinkContext<'_>) -> LinkResult<bool> {
        Ok(false)
    }

    fn on_close_connection(&mut self) {}

    fn on_attach_thread(&mut self) {}

    fn on_detach_thread(&mut self) {}
}

/// Callbacks for a suspended async cycle.
///
/// Invoked from the worker that resumes the link.
pub trait CometHandler: Send + Sync {
    /// Suspend deadline passed before completion
    fn on_timeout(&self) {}

    /// Async cycle ended (completed, timed out or closed)
    fn on_complete(&self) {}
}

/// Outcome of one duplex read cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplexStatus {
    Continue,
    Complete,
}

/// Full-duplex handler installed by `LinkContext::start_duplex`.
///
/// `service_read` is called whenever the peer sends data. A cycle that
/// consumes no bytes counts as a stall and closes the link.
pub trait DuplexHandler: Send {
    fn on_start(&mut self, _cx: &mut DuplexContext<'_>) -> LinkResult<()> {
        Ok(())
    }

    fn service_read(&mut self, cx: &mut DuplexContext<'_>) -> LinkResult<DuplexStatus>;

    fn on_close(&mut self) {}
}

/// What a request handler can see and do during a callback
pub struct LinkContext<'a> {
    pub(crate) link: &'a Arc<Link>,
    pub(crate) socket: &'a mut LinkSocket,
    pub(crate) duplex: &'a mut Option<Box<dyn DuplexHandler>>,
}

impl<'a> LinkContext<'a> {
    pub(crate) fn new(
        link: &'a Arc<Link>,
        socket: &'a mut LinkSocket,
        duplex: &'a mut Option<Box<dyn DuplexHandler>>,
    ) -> Self {
        Self {
            link,
            socket,
            duplex,
        }
    }

    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    pub fn link(&self) -> &Arc<Link> {
        self.link
    }

    pub fn socket(&mut self) -> &mut LinkSocket {
        self.socket
    }

    pub fn connection_start(&self) -> Option<Instant> {
        self.link.timing().connection_start
    }

    pub fn request_start(&self) -> Option<Instant> {
        self.link.timing().request_start
    }

    /// Whether the current cycle may keep the connection alive
    pub fn is_keepalive_allocated(&self) -> bool {
        self.link.state().is_keepalive_allocated()
    }

    pub fn kill_keepalive(&self, reason: &str) {
        self.link.kill_keepalive_owned(reason);
    }

    /// Enter an async cycle. The worker detaches when the callback returns
    /// unless the controller was already completed or woken.
    pub fn to_comet(&mut self, handler: Arc<dyn CometHandler>) -> LinkResult<Arc<CometController>> {
        self.link.to_comet(handler)
    }

    pub fn comet(&self) -> Option<Arc<CometController>> {
        self.link.comet()
    }

    /// Upgrade to full-duplex. One-way: request processing never resumes.
    pub fn start_duplex(&mut self, handler: Box<dyn DuplexHandler>) -> LinkResult<()> {
        self.link.start_duplex(self.socket, self.duplex, handler)
    }
}

/// What a duplex handler can see during a read cycle
pub struct DuplexContext<'a> {
    pub(crate) link: &'a Arc<Link>,
    pub(crate) socket: &'a mut LinkSocket,
}

impl<'a> DuplexContext<'a> {
    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    pub fn socket(&mut self) -> &mut LinkSocket {
        self.socket
    }
}
