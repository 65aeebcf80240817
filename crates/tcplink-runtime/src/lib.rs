//! # tcplink-runtime
//!
//! Threads and sockets for the tcplink connection engine.
//!
//! This crate provides:
//! - [`Launcher`]: elastic worker pool with acceptor bookkeeping and
//!   start-rate throttling
//! - [`Port`]: listener, admission control, link pool and shutdown
//! - [`Link`]: one connection's lifecycle across worker threads
//! - [`PollSelector`]: parks idle keepalive connections without a thread
//! - the suspend reaper, which times out and collects comet links
//!
//! ## Thread model
//!
//! ```text
//! ┌──────────────┐  start_acceptor   ┌──────────────────────────────┐
//! │ launcher     │ ────────────────► │ workers (≤ thread_max)        │
//! │ thread       │   accept queue    │   Accept / Keepalive /        │
//! └──────────────┘                   │   KeepaliveTimeout /          │
//!        ▲                           │   CometResume / Duplex tasks  │
//!        │ wake                      └──────────────────────────────┘
//!        │                                ▲ resume queue
//! ┌──────┴───────┐  ready/expired    ┌────┴─────────┐
//! │ selector     │ ────────────────► │ link wakers  │ ◄── comet complete()
//! │ thread       │                   └──────────────┘ ◄── reaper thread
//! └──────────────┘
//! ```
//!
//! At most one worker runs a given link at a time. Wakers never touch a
//! link's socket; they only win the link's request-state CAS and queue a
//! task for it.

pub mod comet;
pub mod handler;
pub mod launcher;
pub mod link;
pub mod port;
pub mod reaper;
pub mod selector;
pub mod shutdown;
pub mod socket;
pub mod stats;
pub mod task;
pub mod throttle;

// Re-exports
pub use comet::CometController;
pub use handler::{
    CometHandler, DuplexContext, DuplexHandler, DuplexStatus, LinkContext, Protocol,
    RequestHandler,
};
pub use launcher::{AcceptorSource, Launcher, WorkItem};
pub use link::{Link, Timing};
pub use port::{Port, ReadProbe};
pub use reaper::ReaperStats;
pub use selector::{PollSelector, Selector, SELECT_CAPACITY};
pub use shutdown::ShutdownSignal;
pub use socket::{LinkSocket, TlsInfo};
pub use stats::{PortStats, StatsSnapshot};
pub use task::Task;
pub use throttle::Throttle;
