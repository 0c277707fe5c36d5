//! Server performance counters
//!
//! All counters are relaxed atomics: the reactor thread is the only writer,
//! but an operator thread may snapshot them at any time. Readers observe
//! some consistent-enough point-in-time view; exact cross-counter agreement
//! is not promised.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated in-line by the reactor and connections.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub rejected_connections: AtomicU64,
    pub handshake_errors: AtomicU64,
    pub socket_errors: AtomicU64,
    pub buffer_overflows: AtomicU64,
    pub pool_acquires: AtomicU64,
    pub pool_releases: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub last_poll_latency_us: AtomicU64,
    pub max_poll_latency_us: AtomicU64,
}

impl ServerStats {
    pub const fn new() -> Self {
        Self {
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            handshake_errors: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            pool_acquires: AtomicU64::new(0),
            pool_releases: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            last_poll_latency_us: AtomicU64::new(0),
            max_poll_latency_us: AtomicU64::new(0),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.messages_in.store(0, Ordering::Relaxed);
        self.messages_out.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.total_connections.store(0, Ordering::Relaxed);
        self.active_connections.store(0, Ordering::Relaxed);
        self.rejected_connections.store(0, Ordering::Relaxed);
        self.handshake_errors.store(0, Ordering::Relaxed);
        self.socket_errors.store(0, Ordering::Relaxed);
        self.buffer_overflows.store(0, Ordering::Relaxed);
        self.pool_acquires.store(0, Ordering::Relaxed);
        self.pool_releases.store(0, Ordering::Relaxed);
        self.pool_exhausted.store(0, Ordering::Relaxed);
        self.last_poll_latency_us.store(0, Ordering::Relaxed);
        self.max_poll_latency_us.store(0, Ordering::Relaxed);
    }

    /// Overload predicate: active connections above 90% of the admission
    /// limit.
    pub fn is_overloaded(&self, limit: usize) -> bool {
        let active = self.active_connections.load(Ordering::Relaxed);
        active > (limit as u64) * 9 / 10
    }

    /// Record one blocking-wait latency sample.
    pub fn record_poll_latency(&self, micros: u64) {
        self.last_poll_latency_us.store(micros, Ordering::Relaxed);
        if micros > self.max_poll_latency_us.load(Ordering::Relaxed) {
            self.max_poll_latency_us.store(micros, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            handshake_errors: self.handshake_errors.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            pool_acquires: self.pool_acquires.load(Ordering::Relaxed),
            pool_releases: self.pool_releases.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            last_poll_latency_us: self.last_poll_latency_us.load(Ordering::Relaxed),
            max_poll_latency_us: self.max_poll_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Plain-integer snapshot for operator display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub handshake_errors: u64,
    pub socket_errors: u64,
    pub buffer_overflows: u64,
    pub pool_acquires: u64,
    pub pool_releases: u64,
    pub pool_exhausted: u64,
    pub last_poll_latency_us: u64,
    pub max_poll_latency_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_threshold() {
        let stats = ServerStats::new();
        // limit 50 -> threshold 45
        stats.active_connections.store(45, Ordering::Relaxed);
        assert!(!stats.is_overloaded(50));
        stats.active_connections.store(46, Ordering::Relaxed);
        assert!(stats.is_overloaded(50));

        // limit 3 -> threshold 2 (integer division)
        stats.active_connections.store(2, Ordering::Relaxed);
        assert!(!stats.is_overloaded(3));
        stats.active_connections.store(3, Ordering::Relaxed);
        assert!(stats.is_overloaded(3));
    }

    #[test]
    fn poll_latency_max_is_monotonic() {
        let stats = ServerStats::new();
        stats.record_poll_latency(100);
        stats.record_poll_latency(50);
        assert_eq!(stats.last_poll_latency_us.load(Ordering::Relaxed), 50);
        assert_eq!(stats.max_poll_latency_us.load(Ordering::Relaxed), 100);
        stats.record_poll_latency(200);
        assert_eq!(stats.max_poll_latency_us.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn snapshot_and_reset() {
        let stats = ServerStats::new();
        stats.messages_in.fetch_add(3, Ordering::Relaxed);
        stats.bytes_out.fetch_add(42, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_in, 3);
        assert_eq!(snap.bytes_out, 42);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
