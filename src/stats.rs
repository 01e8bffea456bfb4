//! Pool statistics.
//!
//! Aggregate counters only; nothing identifies a destination or a client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by the pool, the flow table and the flows.
pub struct PoolStats {
    start_time: Instant,
    /// Flows that got a slot and a tunnel
    flows_admitted: AtomicU64,
    /// Flows refused for lack of a tunnel or a slot
    flows_rejected: AtomicU64,
    /// Slots returned to the free list
    flows_released: AtomicU64,
    /// Successful tunnel dials
    tunnel_connects: AtomicU64,
    /// Failed tunnel dials
    dial_failures: AtomicU64,
    /// Bytes read from local sockets and sent to the relay
    bytes_to_remote: AtomicU64,
    /// Bytes delivered to local sockets
    bytes_to_local: AtomicU64,
}

impl PoolStats {
    /// Create a new stats collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            flows_admitted: AtomicU64::new(0),
            flows_rejected: AtomicU64::new(0),
            flows_released: AtomicU64::new(0),
            tunnel_connects: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            bytes_to_remote: AtomicU64::new(0),
            bytes_to_local: AtomicU64::new(0),
        }
    }

    pub(crate) fn flow_admitted(&self) {
        self.flows_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn flow_rejected(&self) {
        self.flows_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn flow_released(&self) {
        self.flows_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tunnel_connected(&self) {
        self.tunnel_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_to_remote(&self, bytes: u64) {
        self.bytes_to_remote.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_to_local(&self, bytes: u64) {
        self.bytes_to_local.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get failed dials.
    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    /// Get successful dials.
    pub fn tunnel_connects(&self) -> u64 {
        self.tunnel_connects.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            flows_admitted: self.flows_admitted.load(Ordering::Relaxed),
            flows_rejected: self.flows_rejected.load(Ordering::Relaxed),
            flows_released: self.flows_released.load(Ordering::Relaxed),
            tunnel_connects: self.tunnel_connects(),
            dial_failures: self.dial_failures(),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_to_local: self.bytes_to_local.load(Ordering::Relaxed),
        }
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all counters at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub flows_admitted: u64,
    pub flows_rejected: u64,
    pub flows_released: u64,
    pub tunnel_connects: u64,
    pub dial_failures: u64,
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
}

impl StatsSnapshot {
    /// Flows currently holding a slot, as seen by the counters.
    pub fn flows_open(&self) -> u64 {
        self.flows_admitted.saturating_sub(self.flows_released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = PoolStats::new();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.flows_admitted, 0);
        assert_eq!(snapshot.bytes_to_local, 0);
    }

    #[test]
    fn test_flow_counting() {
        let stats = PoolStats::new();

        stats.flow_admitted();
        stats.flow_admitted();
        stats.flow_rejected();
        stats.flow_released();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.flows_admitted, 2);
        assert_eq!(snapshot.flows_rejected, 1);
        assert_eq!(snapshot.flows_open(), 1);
    }

    #[test]
    fn test_bytes_and_dials() {
        let stats = PoolStats::new();

        stats.add_bytes_to_remote(100);
        stats.add_bytes_to_local(250);
        stats.dial_failed();
        stats.tunnel_connected();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_to_remote, 100);
        assert_eq!(snapshot.bytes_to_local, 250);
        assert_eq!(stats.dial_failures(), 1);
        assert_eq!(stats.tunnel_connects(), 1);
    }
}
