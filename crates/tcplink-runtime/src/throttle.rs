//! Admission throttle
//!
//! Bounds the number of accepted sockets open at once. Once the bound is
//! reached new connections are closed immediately instead of queued.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct Throttle {
    max: usize,
    open: AtomicUsize,
}

impl Throttle {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            open: AtomicUsize::new(0),
        }
    }

    /// Admit one more socket. Each `true` must be paired with `close()`.
    pub fn accept(&self) -> bool {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.max).then_some(open + 1)
            })
            .is_ok()
    }

    pub fn close(&self) {
        let _ = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| open.checked_sub(1));
    }

    #[inline]
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn max(&self) -> usize {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_bound() {
        let throttle = Throttle::new(2);
        assert!(throttle.accept());
        assert!(throttle.accept());
        assert!(!throttle.accept());

        throttle.close();
        assert!(throttle.accept());
        assert_eq!(throttle.open_count(), 2);
    }

    #[test]
    fn test_close_never_underflows() {
        let throttle = Throttle::new(1);
        throttle.close();
        assert_eq!(throttle.open_count(), 0);
    }

    #[test]
    fn test_concurrent_admission() {
        let throttle = Arc::new(Throttle::new(10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                thread::spawn(move || (0..100).filter(|_| throttle.accept()).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
    }
}
