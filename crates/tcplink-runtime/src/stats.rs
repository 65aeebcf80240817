//! Lifetime counters for a port

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct PortStats {
    requests: AtomicU64,
    keepalives: AtomicU64,
    select_keepalives: AtomicU64,
    client_disconnects: AtomicU64,
    throttle_disconnects: AtomicU64,
    connections: AtomicU64,
    comet_timeouts: AtomicU64,
    duplex_stalls: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
}

/// Point-in-time copy of [`PortStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub keepalives: u64,
    pub select_keepalives: u64,
    pub client_disconnects: u64,
    pub throttle_disconnects: u64,
    pub connections: u64,
    pub comet_timeouts: u64,
    pub duplex_stalls: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        #[inline]
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl PortStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(add_request, requests);
    counter!(add_keepalive, keepalives);
    counter!(add_select_keepalive, select_keepalives);
    counter!(add_client_disconnect, client_disconnects);
    counter!(add_throttle_disconnect, throttle_disconnects);
    counter!(add_connection, connections);
    counter!(add_comet_timeout, comet_timeouts);
    counter!(add_duplex_stall, duplex_stalls);

    #[inline]
    pub fn add_bytes(&self, read: u64, write: u64) {
        self.read_bytes.fetch_add(read, Ordering::Relaxed);
        self.write_bytes.fetch_add(write, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            keepalives: self.keepalives.load(Ordering::Relaxed),
            select_keepalives: self.select_keepalives.load(Ordering::Relaxed),
            client_disconnects: self.client_disconnects.load(Ordering::Relaxed),
            throttle_disconnects: self.throttle_disconnects.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            comet_timeouts: self.comet_timeouts.load(Ordering::Relaxed),
            duplex_stalls: self.duplex_stalls.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = PortStats::new();
        stats.add_request();
        stats.add_request();
        stats.add_client_disconnect();
        stats.add_bytes(10, 20);
        stats.add_bytes(1, 2);

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.client_disconnects, 1);
        assert_eq!(snap.read_bytes, 11);
        assert_eq!(snap.write_bytes, 22);
        assert_eq!(snap.keepalives, 0);
    }
}
