//! Process-wide shutdown signal
//!
//! Per-connection failures stay inside their link. Resource exhaustion
//! does not: a worker that cannot be spawned, or an accept that fails
//! with `ENOMEM`, flags this signal and every waiter wakes up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
    cond: Condvar,
}

/// Cloneable handle; all clones observe the same signal
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fatal, process-wide. The first reason wins.
    pub fn shutdown_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(%reason, "fatal shutdown requested");

        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.inner.flag.store(true, Ordering::Release);
        self.inner.cond.notify_all();
    }

    /// Orderly shutdown with no error
    pub fn shutdown(&self) {
        let _slot = self.inner.reason.lock();
        self.inner.flag.store(true, Ordering::Release);
        self.inner.cond.notify_all();
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Reason given to `shutdown_fatal`, if any
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Block until signalled
    pub fn wait(&self) {
        let mut slot = self.inner.reason.lock();
        while !self.is_shutdown() {
            self.inner.cond.wait(&mut slot);
        }
    }

    /// Block until signalled or `timeout` elapses. True when signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut slot = self.inner.reason.lock();
        if !self.is_shutdown() {
            self.inner.cond.wait_for(&mut slot, timeout);
        }
        self.is_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_wakes_on_fatal() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                signal.wait();
                signal.reason()
            })
        };

        thread::sleep(Duration::from_millis(20));
        signal.shutdown_fatal("worker spawn failed");
        signal.shutdown_fatal("second reason ignored");

        assert_eq!(waiter.join().unwrap().as_deref(), Some("worker spawn failed"));
        assert!(signal.is_shutdown());
    }

    #[test]
    fn test_wait_timeout() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));

        signal.shutdown();
        assert!(signal.wait_timeout(Duration::from_millis(10)));
        assert_eq!(signal.reason(), None);
    }
}
