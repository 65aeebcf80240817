//! tcplink echo server
//!
//! Line protocol over one kept-alive connection:
//!
//!   <text>           echoed back
//!   /wait            suspend (comet) until another client sends /notify
//!   /notify <text>   wake every waiting client with <text>
//!   UPGRADE          switch to raw duplex echo until the peer closes
//!   /quit            close the connection
//!
//! Usage:
//!     cargo build --release -p echo-link
//!     ./target/release/echo-link [--port 7000] [--idle 4 64] [--threads 256] [--stats 10]
//!
//! Every `TCPLINK_*` variable is honoured; CLI flags override them.
//! Logging is controlled by `TCPLINK_LOG` (default `info`).
//!
//! Test with:
//!     nc localhost 7000            # type lines, /wait, UPGRADE
//!     echo "/notify hi" | nc -q1 localhost 7000

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{SigSet, Signal};
use parking_lot::Mutex;
use tcplink::{
    protocol_fn, CometController, CometHandler, DuplexContext, DuplexHandler, DuplexStatus,
    LinkContext, LinkId, LinkResult, Port, RequestHandler, Server, ShutdownSignal,
};
use tracing_subscriber::EnvFilter;

// ── Comet board ──

type Inbox = Arc<Mutex<Option<String>>>;

/// Clients parked in /wait
#[derive(Default)]
struct Board {
    waiting: Mutex<Vec<(Arc<CometController>, Inbox)>>,
}

impl Board {
    fn park(&self, comet: Arc<CometController>, inbox: Inbox) {
        self.waiting.lock().push((comet, inbox));
    }

    fn notify(&self, text: &str) -> usize {
        let waiting = std::mem::take(&mut *self.waiting.lock());
        let mut woken = 0;
        for (comet, inbox) in waiting {
            *inbox.lock() = Some(text.to_string());
            if comet.complete() {
                woken += 1;
            }
        }
        woken
    }

    fn forget(&self, link: LinkId) {
        self.waiting.lock().retain(|(comet, _)| comet.link_id() != link);
    }
}

struct WaitLog {
    link: LinkId,
    board: Arc<Board>,
}

impl CometHandler for WaitLog {
    fn on_timeout(&self) {
        tracing::info!(link = %self.link, "wait timed out");
    }

    fn on_complete(&self) {
        self.board.forget(self.link);
    }
}

// ── Duplex ──

struct RawEcho;

impl DuplexHandler for RawEcho {
    fn on_start(&mut self, cx: &mut DuplexContext<'_>) -> LinkResult<()> {
        tracing::info!(link = %cx.link_id(), "upgraded to duplex");
        writeln!(cx.socket(), "UPGRADED")?;
        Ok(())
    }

    fn service_read(&mut self, cx: &mut DuplexContext<'_>) -> LinkResult<DuplexStatus> {
        let data = cx.socket().buffer().to_vec();
        cx.socket().consume(data.len());
        cx.socket().write_all(&data)?;
        Ok(DuplexStatus::Continue)
    }
}

// ── Line handler ──

struct LineEcho {
    link: LinkId,
    board: Arc<Board>,
    inbox: Inbox,
}

impl RequestHandler for LineEcho {
    fn on_start_connection(&mut self, cx: &mut LinkContext<'_>) -> LinkResult<()> {
        tracing::debug!(link = %self.link, peer = %cx.socket().peer_addr(), "client connected");
        Ok(())
    }

    fn handle_request(&mut self, cx: &mut LinkContext<'_>) -> LinkResult<bool> {
        let Some(line) = cx.socket().read_line()? else {
            return Ok(false);
        };

        match line.split_once(' ').map_or((line.as_str(), ""), |(cmd, rest)| (cmd, rest)) {
            ("/quit", _) => {
                writeln!(cx.socket(), "bye")?;
                Ok(false)
            }
            ("/wait", _) => {
                let comet = cx.to_comet(Arc::new(WaitLog {
                    link: self.link,
                    board: Arc::clone(&self.board),
                }))?;
                self.board.park(comet, Arc::clone(&self.inbox));
                Ok(true)
            }
            ("/notify", text) => {
                let woken = self.board.notify(text);
                writeln!(cx.socket(), "notified {woken}")?;
                Ok(true)
            }
            ("UPGRADE", _) => {
                cx.start_duplex(Box::new(RawEcho))?;
                Ok(true)
            }
            _ => {
                writeln!(cx.socket(), "{line}")?;
                Ok(true)
            }
        }
    }

    fn handle_resume(&mut self, cx: &mut LinkContext<'_>) -> LinkResult<bool> {
        match self.inbox.lock().take() {
            Some(text) => writeln!(cx.socket(), "{text}")?,
            None => writeln!(cx.socket(), "woken")?,
        }
        Ok(true)
    }

    fn on_close_connection(&mut self) {
        self.inbox.lock().take();
        self.board.forget(self.link);
    }
}

// ── Main ──

struct Args {
    port: Option<u16>,
    idle: Option<(usize, usize)>,
    threads: Option<usize>,
    stats: Duration,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        port: None,
        idle: None,
        threads: None,
        stats: Duration::from_secs(10),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                parsed.port = args.get(i).and_then(|s| s.parse().ok());
            }
            "--idle" => {
                let min = args.get(i + 1).and_then(|s| s.parse().ok());
                let max = args.get(i + 2).and_then(|s| s.parse().ok());
                if let (Some(min), Some(max)) = (min, max) {
                    parsed.idle = Some((min, max));
                }
                i += 2;
            }
            "--threads" | "-t" => {
                i += 1;
                parsed.threads = args.get(i).and_then(|s| s.parse().ok());
            }
            "--stats" => {
                i += 1;
                if let Some(secs) = args.get(i).and_then(|s| s.parse().ok()) {
                    parsed.stats = Duration::from_secs(secs);
                }
            }
            other => tracing::warn!(arg = other, "unknown argument"),
        }
        i += 1;
    }
    parsed
}

/// Route SIGINT/SIGTERM to the shutdown signal. Must run before any other
/// thread is spawned so every thread inherits the blocked mask.
fn install_signals(shutdown: ShutdownSignal) -> nix::Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block()?;

    thread::Builder::new()
        .name("echo-link-signal".into())
        .spawn(move || match set.wait() {
            Ok(signal) => {
                tracing::info!(?signal, "signal received");
                shutdown.shutdown();
            }
            Err(e) => tracing::error!(error = %e, "sigwait failed"),
        })
        .map_err(|_| nix::Error::EAGAIN)?;
    Ok(())
}

fn log_stats(port: &Port) {
    let stats = port.stats();
    tracing::info!(
        active = port.active_connection_count(),
        threads = port.thread_count(),
        idle = port.idle_thread_count(),
        keepalive = port.keepalive_connection_count(),
        select = port.select_count(),
        comet = port.comet_idle_count(),
        requests = stats.requests,
        connections = stats.connections,
        "stats"
    );
}

fn main() -> LinkResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TCPLINK_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();
    let shutdown = ShutdownSignal::new();
    if let Err(e) = install_signals(shutdown.clone()) {
        tracing::warn!(error = %e, "signal handling unavailable");
    }

    let mut server = Server::from_env()
        .configure(|c| {
            let launcher = c.launcher.clone().name("echo-link");
            c.launcher(launcher)
        })
        .shutdown_signal(shutdown.clone());
    if let Some(port) = args.port {
        server = server.configure(|c| c.port(port));
    } else if server.config().port == 0 {
        server = server.configure(|c| c.port(7000));
    }
    if let Some((min, max)) = args.idle {
        server = server.configure(|c| c.accept_idle(min, max));
    }
    if let Some(threads) = args.threads {
        server = server.configure(|c| c.thread_max(threads));
    }

    let board = Arc::new(Board::default());
    let port = server.start(protocol_fn(move |link| {
        Box::new(LineEcho {
            link,
            board: Arc::clone(&board),
            inbox: Arc::new(Mutex::new(None)),
        })
    }).named("echo-link"))?;

    while !shutdown.wait_timeout(args.stats) {
        log_stats(&port);
    }

    tracing::info!("shutting down");
    if !port.close_and_wait(Duration::from_secs(10)) {
        tracing::warn!(threads = port.thread_count(), "workers still running");
    }
    log_stats(&port);
    Ok(())
}
