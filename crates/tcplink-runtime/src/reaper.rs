//! Suspend reaper thread
//!
//! Sweeps the port's suspended (comet) links every
//! `suspend_reaper_interval`:
//!
//! - past its suspend deadline: comet timeout, the link resumes and closes
//! - suspended longer than `suspend_close_time_max` with the peer gone:
//!   completed and closed
//!
//! The same loop watches the shutdown signal and closes the port when it
//! fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::port::PortShared;

/// Upper bound on one sleep so stop requests are noticed quickly
const REAPER_SLICE: Duration = Duration::from_millis(50);

/// Totals over the reaper's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    pub sweeps: u64,
    pub timeouts: u64,
    pub closes: u64,
}

pub(crate) struct ReaperHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<ReaperStats>>,
}

impl ReaperHandle {
    /// Stop the thread and collect its totals. Called from the reaper
    /// itself it only flags the stop.
    pub(crate) fn stop(mut self) -> Option<ReaperStats> {
        self.stop.store(true, Ordering::Release);

        let handle = self.thread.take()?;
        if handle.thread().id() == thread::current().id() {
            return None;
        }
        handle.join().ok()
    }
}

pub(crate) fn spawn_reaper(
    name: &str,
    port: Weak<PortShared>,
    interval: Duration,
) -> std::io::Result<ReaperHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let thread = thread::Builder::new()
        .name(format!("{name}-reaper"))
        .spawn(move || reaper_loop(port, interval, thread_stop))?;

    Ok(ReaperHandle {
        stop,
        thread: Some(thread),
    })
}

fn reaper_loop(port: Weak<PortShared>, interval: Duration, stop: Arc<AtomicBool>) -> ReaperStats {
    let mut stats = ReaperStats::default();
    let mut next_sweep = Instant::now() + interval;

    while !stop.load(Ordering::Acquire) {
        let Some(shared) = port.upgrade() else {
            break;
        };

        if shared.shutdown().is_shutdown() {
            tracing::info!(
                reason = shared.shutdown().reason().as_deref().unwrap_or("requested"),
                "shutdown signal, closing port"
            );
            shared.close();
            break;
        }

        let now = Instant::now();
        if now >= next_sweep {
            let (timeouts, closes) = shared.reap_suspended(now);
            stats.sweeps += 1;
            stats.timeouts += timeouts as u64;
            stats.closes += closes as u64;

            if timeouts + closes > 0 {
                tracing::debug!(timeouts, closes, "reaper sweep");
            }
            next_sweep = now + interval;
        }
        drop(shared);

        let sleep = next_sweep
            .saturating_duration_since(Instant::now())
            .min(REAPER_SLICE);
        thread::sleep(sleep);
    }

    tracing::debug!(sweeps = stats.sweeps, "reaper exit");
    stats
}
