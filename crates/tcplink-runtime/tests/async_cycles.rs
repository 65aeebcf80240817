//! Comet suspend/resume and duplex upgrade over loopback sockets

use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tcplink_core::{LinkId, LinkResult, PortConfig};
use tcplink_runtime::{
    CometController, CometHandler, DuplexContext, DuplexHandler, DuplexStatus, LinkContext, Port,
    Protocol, RequestHandler,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("TCPLINK_LOG"))
        .with_test_writer()
        .try_init();
}

fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn connect(addr: SocketAddr) -> (TcpStream, BufReader<TcpStream>) {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    (stream, reader)
}

fn config() -> PortConfig {
    PortConfig::new()
        .bind("127.0.0.1:0")
        .unwrap()
        .accept_idle(1, 2)
        .thread_max(4)
        .suspend_time_max(Duration::from_millis(500))
        .suspend_reaper_interval(Duration::from_millis(100))
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Default)]
struct Shared {
    controllers: Mutex<Vec<Arc<CometController>>>,
    timeouts: AtomicUsize,
    completes: AtomicUsize,
}

struct Recorder(Arc<Shared>);

impl CometHandler for Recorder {
    fn on_timeout(&self) {
        self.0.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_complete(&self) {
        self.0.completes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Drops every byte it is handed
struct Sink;

impl DuplexHandler for Sink {
    fn service_read(&mut self, cx: &mut DuplexContext<'_>) -> LinkResult<DuplexStatus> {
        let n = cx.socket().available();
        cx.socket().consume(n);
        Ok(DuplexStatus::Continue)
    }
}

/// Never consumes anything
struct Staller(Arc<AtomicBool>);

impl DuplexHandler for Staller {
    fn service_read(&mut self, _cx: &mut DuplexContext<'_>) -> LinkResult<DuplexStatus> {
        Ok(DuplexStatus::Continue)
    }

    fn on_close(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Upper-cases duplex traffic until it sees `BYE`
struct Shout;

impl DuplexHandler for Shout {
    fn on_start(&mut self, cx: &mut DuplexContext<'_>) -> LinkResult<()> {
        writeln!(cx.socket(), "UPGRADED")?;
        Ok(())
    }

    fn service_read(&mut self, cx: &mut DuplexContext<'_>) -> LinkResult<DuplexStatus> {
        let data = cx.socket().buffer().to_vec();
        cx.socket().consume(data.len());
        if data.windows(3).any(|w| w == b"BYE") {
            return Ok(DuplexStatus::Complete);
        }
        cx.socket().write_all(&data.to_ascii_uppercase())?;
        Ok(DuplexStatus::Continue)
    }
}

/// `wait` suspends, `instant` completes its comet before returning,
/// `stall`/`shout`/`sink` upgrade, anything else echoes
struct Commands {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl RequestHandler for Commands {
    fn handle_request(&mut self, cx: &mut LinkContext<'_>) -> LinkResult<bool> {
        let Some(line) = cx.socket().read_line()? else {
            return Ok(false);
        };

        match line.as_str() {
            "wait" => {
                let comet = cx.to_comet(Arc::new(Recorder(Arc::clone(&self.shared))))?;
                self.shared.controllers.lock().push(comet);
            }
            "instant" => {
                let comet = cx.to_comet(Arc::new(Recorder(Arc::clone(&self.shared))))?;
                comet.complete();
            }
            "stall" => cx.start_duplex(Box::new(Staller(Arc::clone(&self.closed))))?,
            "shout" => cx.start_duplex(Box::new(Shout))?,
            "sink" => cx.start_duplex(Box::new(Sink))?,
            other => writeln!(cx.socket(), "{other}")?,
        }
        Ok(true)
    }

    fn handle_resume(&mut self, cx: &mut LinkContext<'_>) -> LinkResult<bool> {
        let timed_out = cx.comet().is_some_and(|c| c.is_timeout());
        if !timed_out {
            writeln!(cx.socket(), "done")?;
        }
        Ok(true)
    }
}

struct CommandProtocol {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl Protocol for CommandProtocol {
    fn create_handler(&self, _link: LinkId) -> Box<dyn RequestHandler> {
        Box::new(Commands {
            shared: Arc::clone(&self.shared),
            closed: Arc::clone(&self.closed),
        })
    }
}

fn start(config: PortConfig) -> (Port, SocketAddr, Arc<Shared>, Arc<AtomicBool>) {
    init_tracing();
    let shared = Arc::new(Shared::default());
    let closed = Arc::new(AtomicBool::new(false));
    let port = Port::new(
        config,
        CommandProtocol {
            shared: Arc::clone(&shared),
            closed: Arc::clone(&closed),
        },
    )
    .unwrap();
    let addr = port.start().unwrap();
    (port, addr, shared, closed)
}

// ============================================================================
// Comet
// ============================================================================

#[test]
fn test_comet_complete_resumes_and_keeps_alive() {
    let (port, addr, shared, _) = start(config());
    let (mut stream, mut reader) = connect(addr);

    writeln!(stream, "wait").unwrap();
    assert!(wait_for(|| port.comet_idle_count() == 1, Duration::from_secs(5)));

    let comet = shared.controllers.lock().pop().unwrap();
    assert!(comet.complete());

    let mut reply = String::new();
    reader.read_line(&mut reply).unwrap();
    assert_eq!(reply, "done\n");
    assert_eq!(port.comet_idle_count(), 0);
    assert!(wait_for(|| shared.completes.load(Ordering::SeqCst) == 1, Duration::from_secs(5)));

    // Same connection serves the next request
    writeln!(stream, "again").unwrap();
    reply.clear();
    reader.read_line(&mut reply).unwrap();
    assert_eq!(reply, "again\n");

    // Late wakes are ignored
    assert!(!comet.wake());

    port.close();
}

#[test]
fn test_comet_timeout_closes() {
    let (port, addr, shared, _) = start(config());
    let (mut stream, mut reader) = connect(addr);

    let started = Instant::now();
    writeln!(stream, "wait").unwrap();
    assert!(wait_for(|| port.comet_idle_count() == 1, Duration::from_secs(5)));

    let mut reply = String::new();
    assert_eq!(reader.read_line(&mut reply).unwrap(), 0);
    // Closed within one reaper tick of the deadline
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed <= Duration::from_millis(500 + 100 + 400), "{elapsed:?}");

    assert_eq!(shared.timeouts.load(Ordering::SeqCst), 1);
    assert!(wait_for(|| port.stats().comet_timeouts == 1, Duration::from_secs(5)));
    assert_eq!(port.comet_idle_count(), 0);

    port.close();
}

#[test]
fn test_comet_completed_inline_keeps_serving() {
    const ROUNDS: usize = 100_000;

    let (port, addr, shared, _) = start(config());
    let (stream, mut reader) = connect(addr);

    let feeder = thread::spawn(move || {
        let mut writer = BufWriter::new(stream);
        for _ in 0..ROUNDS {
            writer.write_all(b"instant\n").unwrap();
        }
        writer.flush().unwrap();
        writer
    });

    let mut reply = String::new();
    for _ in 0..ROUNDS {
        reply.clear();
        reader.read_line(&mut reply).unwrap();
        assert_eq!(reply, "done\n");
    }
    let _writer = feeder.join().unwrap();

    assert_eq!(shared.completes.load(Ordering::SeqCst), ROUNDS);
    assert_eq!(port.stats().requests, ROUNDS as u64);
    assert_eq!(port.comet_idle_count(), 0);

    port.close();
}

#[test]
fn test_comet_complete_and_close() {
    let (port, addr, shared, _) = start(config().suspend_time_max(Duration::from_secs(60)));
    let (mut stream, mut reader) = connect(addr);

    writeln!(stream, "wait").unwrap();
    assert!(wait_for(|| port.comet_idle_count() == 1, Duration::from_secs(5)));
    let comet = shared.controllers.lock().pop().unwrap();
    assert!(!comet.is_timeout());

    assert!(comet.complete_and_close());
    assert!(comet.is_complete_requested());

    // Final write, then the server hangs up
    let mut reply = String::new();
    reader.read_line(&mut reply).unwrap();
    assert_eq!(reply, "done\n");
    reply.clear();
    assert_eq!(reader.read_line(&mut reply).unwrap(), 0);
    assert_eq!(shared.timeouts.load(Ordering::SeqCst), 0);

    port.close();
}

// ============================================================================
// Duplex
// ============================================================================

#[test]
fn test_duplex_round_trip() {
    let (port, addr, _, _) = start(config());
    let (mut stream, mut reader) = connect(addr);

    writeln!(stream, "shout").unwrap();
    let mut reply = String::new();
    reader.read_line(&mut reply).unwrap();
    assert_eq!(reply, "UPGRADED\n");

    writeln!(stream, "hello duplex").unwrap();
    reply.clear();
    reader.read_line(&mut reply).unwrap();
    assert_eq!(reply, "HELLO DUPLEX\n");

    stream.write_all(b"BYE\n").unwrap();
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    port.close();
}

#[test]
fn test_duplex_stall_closes() {
    let (port, addr, _, closed) = start(config());
    let (mut stream, mut reader) = connect(addr);

    stream.write_all(b"stall\nxyz").unwrap();

    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    assert!(wait_for(|| closed.load(Ordering::SeqCst), Duration::from_secs(5)));
    assert_eq!(port.stats().duplex_stalls, 1);

    port.close();
}

#[test]
fn test_duplex_peer_close() {
    let (port, addr, _, _) = start(config());
    let (mut stream, reader) = connect(addr);

    stream.write_all(b"sink\n").unwrap();
    stream.write_all(b"some bytes").unwrap();
    drop(reader);
    drop(stream);

    assert!(wait_for(|| port.stats().read_bytes > 0, Duration::from_secs(5)));
    assert!(wait_for(|| port.open_connection_count() == 0, Duration::from_secs(5)));
    assert_eq!(port.stats().duplex_stalls, 0);

    port.close();
}
