//! # tcplink - thread-per-request TCP connection engine
//!
//! Serves a TCP port with a pool of blocking worker threads while keeping
//! idle connections off those threads.
//!
//! ## Features
//!
//! - **Elastic pool**: acceptors between `idle_min` and `idle_max`, workers
//!   capped at `thread_max`, start rate throttled
//! - **Keepalive**: short wait on the worker, then a `poll(2)` selector
//!   holds the idle connection without a thread
//! - **Comet**: a handler suspends its request and any thread resumes it
//!   through a [`CometController`]
//! - **Duplex**: one-way upgrade to a read-driven full-duplex handler
//! - **Admission**: connection limit and saturation checks at accept
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::io::Write;
//! use tcplink::{protocol_fn, LinkContext, LinkResult, RequestHandler, Server};
//!
//! struct Echo;
//!
//! impl RequestHandler for Echo {
//!     fn handle_request(&mut self, cx: &mut LinkContext<'_>) -> LinkResult<bool> {
//!         let Some(line) = cx.socket().read_line()? else {
//!             return Ok(false);
//!         };
//!         writeln!(cx.socket(), "{line}")?;
//!         Ok(true)
//!     }
//! }
//!
//! fn main() -> LinkResult<()> {
//!     Server::from_env()
//!         .bind("127.0.0.1:7000")?
//!         .run(protocol_fn(|_| Box::new(Echo)))
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Protocol / RequestHandler                   │
//! │        handle_request, to_comet, start_duplex               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Port                               │
//! │      admission, link pool, keepalive budget, close          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Launcher  │      │ Selector  │      │  Reaper   │
//!    │ + workers │      │  Thread   │      │  Thread   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │          Link: LinkState + RequestStateCell             │
//!    │   one owner at a time, wakers only win a CAS            │
//!    └─────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

// Re-export core types
pub use tcplink_core::{
    ConfigError, DestroyOutcome, IllegalTransition, LauncherConfig, LinkError, LinkEvent, LinkId,
    LinkResult, LinkState, Machine, PortConfig, RequestState, RequestStateCell, TaskKind,
    TaskResult,
};

// Re-export env utilities
pub use tcplink_core::env::{env_get, env_get_bool, env_get_millis};

// Re-export runtime types
pub use tcplink_runtime::{
    CometController, CometHandler, DuplexContext, DuplexHandler, DuplexStatus, Link, LinkContext,
    LinkSocket, PollSelector, Port, Protocol, RequestHandler, Selector, ShutdownSignal,
    StatsSnapshot, Timing,
};

/// How long [`Server::run`] waits for workers after the port closes
const RUN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Protocol`] built from a closure
pub struct FnProtocol<F> {
    name: &'static str,
    factory: F,
}

impl<F> FnProtocol<F> {
    /// Name reported by [`Protocol::name`]
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl<F> Protocol for FnProtocol<F>
where
    F: Fn(LinkId) -> Box<dyn RequestHandler> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.name
    }

    fn create_handler(&self, link: LinkId) -> Box<dyn RequestHandler> {
        (self.factory)(link)
    }
}

/// Wrap a handler factory as a [`Protocol`]
pub fn protocol_fn<F>(factory: F) -> FnProtocol<F>
where
    F: Fn(LinkId) -> Box<dyn RequestHandler> + Send + Sync + 'static,
{
    FnProtocol {
        name: "tcp",
        factory,
    }
}

/// Convenience builder around [`Port`]
///
/// `start` returns the running port; `run` additionally blocks until the
/// shutdown signal fires, then closes and drains.
pub struct Server {
    config: PortConfig,
    shutdown: ShutdownSignal,
    selector: Option<Arc<dyn Selector>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Library defaults
    pub fn new() -> Self {
        Self::with_config(PortConfig::new())
    }

    /// Defaults overridden by `TCPLINK_*` environment variables
    pub fn from_env() -> Self {
        Self::with_config(PortConfig::from_env())
    }

    pub fn with_config(config: PortConfig) -> Self {
        Self {
            config,
            shutdown: ShutdownSignal::new(),
            selector: None,
        }
    }

    /// Parse and set the listen address
    pub fn bind(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.config = self.config.bind(addr)?;
        Ok(self)
    }

    /// Adjust the port configuration in place
    pub fn configure(mut self, f: impl FnOnce(PortConfig) -> PortConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// Share a shutdown signal, e.g. with a signal handler
    pub fn shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = signal;
        self
    }

    /// Replace the built-in poll selector
    pub fn selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// Handle that stops [`Server::run`]
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Build and start the port
    pub fn start(self, protocol: impl Protocol) -> LinkResult<Port> {
        let name = protocol.name().to_string();
        let mut port = Port::with_shutdown(self.config, protocol, self.shutdown)?;
        if let Some(selector) = self.selector {
            port = port.with_selector(selector);
        }

        let addr = port.start()?;
        tracing::info!(%addr, protocol = %name, "server listening");
        Ok(port)
    }

    /// Start, block until shutdown, then close
    pub fn run(self, protocol: impl Protocol) -> LinkResult<()> {
        let shutdown = self.shutdown.clone();
        let port = self.start(protocol)?;

        shutdown.wait();
        tracing::info!(
            reason = shutdown.reason().as_deref().unwrap_or("requested"),
            "server stopping"
        );

        if !port.close_and_wait(RUN_DRAIN_TIMEOUT) {
            tracing::warn!(threads = port.thread_count(), "workers still running after close");
        }

        let stats = port.stats();
        tracing::info!(
            connections = stats.connections,
            requests = stats.requests,
            keepalives = stats.keepalives,
            "server stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;
    use std::thread;

    struct Upper;

    impl RequestHandler for Upper {
        fn handle_request(&mut self, cx: &mut LinkContext<'_>) -> LinkResult<bool> {
            let Some(line) = cx.socket().read_line()? else {
                return Ok(false);
            };
            writeln!(cx.socket(), "{}", line.to_uppercase())?;
            Ok(true)
        }
    }

    fn small(config: PortConfig) -> PortConfig {
        config.accept_idle(1, 2).thread_max(4)
    }

    #[test]
    fn test_builder() {
        let server = Server::new()
            .bind("127.0.0.1:0")
            .unwrap()
            .configure(|c| small(c).keepalive_max(7));
        assert_eq!(server.config().keepalive_max, 7);
        assert_eq!(server.config().launcher.thread_max, 4);

        assert!(Server::new().bind("not an address").is_err());
    }

    #[test]
    fn test_protocol_fn() {
        let protocol = protocol_fn(|_| Box::new(Upper)).named("upper");
        assert_eq!(protocol.name(), "upper");
    }

    #[test]
    fn test_start_serves() {
        let port = Server::new()
            .bind("127.0.0.1:0")
            .unwrap()
            .configure(small)
            .start(protocol_fn(|_| Box::new(Upper)))
            .unwrap();
        let addr = port.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());

        writeln!(stream, "hello").unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        assert_eq!(reply, "HELLO\n");

        port.close();
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let server = Server::new()
            .bind("127.0.0.1:0")
            .unwrap()
            .configure(small);
        let shutdown = server.shutdown_handle();

        let runner = thread::spawn(move || server.run(protocol_fn(|_| Box::new(Upper))));

        thread::sleep(Duration::from_millis(100));
        shutdown.shutdown();

        assert!(runner.join().unwrap().is_ok());
    }
}
