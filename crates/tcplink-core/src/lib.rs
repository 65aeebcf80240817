//! # tcplink-core
//!
//! Platform-agnostic building blocks of the tcplink connection engine.
//!
//! This crate holds no threads and no sockets. It defines:
//!
//! - [`RequestStateCell`]: lock-free owner/waker coordination per link
//! - [`LinkState`]: the per-link phase machine and its resource effects
//! - [`TaskResult`] / [`TaskKind`]: the task contract
//! - [`PortConfig`] / [`LauncherConfig`]: configuration with env overrides
//! - [`LinkError`]: the error taxonomy
//!
//! ## Two machines, one link
//!
//! ```text
//!   owning worker                        external wakers
//!   ─────────────                        ───────────────
//!   LinkState (owner-only, locked)       selector readiness
//!        │                               reaper timeout
//!        ▼                               comet complete()
//!   RequestStateCell  ◄──── CAS ────────────────┘
//! ```
//!
//! `LinkState` says what phase the connection is in. `RequestStateCell`
//! says who is allowed to dispatch it next.

pub mod config;
pub mod env;
pub mod error;
pub mod id;
pub mod link_state;
pub mod request_state;
pub mod task;

pub use config::{LauncherConfig, PortConfig};
pub use error::{ConfigError, IllegalTransition, LinkError, LinkResult, Machine};
pub use id::{LinkId, LinkIdGen};
pub use link_state::{LinkEvent, LinkState, Slot, Transition};
pub use request_state::{DestroyOutcome, RequestState, RequestStateCell};
pub use task::{TaskKind, TaskResult};
