//! Conductor client metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of client metrics at a point in time.
pub struct MetricsSnapshot {
    /// Calls issued.
    pub requests: u64,
    /// Calls answered by a conductor with a response.
    pub successes: u64,
    /// Calls answered by a conductor with an error.
    pub rejections: u64,
    /// Retries against the same conductor.
    pub retries: u64,
    /// Moves to the next conductor.
    pub failovers: u64,
    /// Per-attempt timeouts.
    pub timeouts: u64,
    /// Calls that exhausted every conductor.
    pub unreachable: u64,
    /// Calls that ran out of time.
    pub deadline_exceeded: u64,
    /// Connections opened.
    pub connections_opened: u64,
}

/// Thread-safe conductor client metrics collector.
#[derive(Default)]
pub struct ClientMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    rejections: AtomicU64,
    retries: AtomicU64,
    failovers: AtomicU64,
    timeouts: AtomicU64,
    unreachable: AtomicU64,
    deadline_exceeded: AtomicU64,
    connections_opened: AtomicU64,
}

impl ClientMetrics {
    /// Creates zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_successes(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_rejections(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_failovers(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_unreachable(&self) {
        self.unreachable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_deadline_exceeded(&self) {
        self.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ClientMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ClientMetrics::new();
        metrics.inc_requests();
        metrics.inc_requests();
        metrics.inc_failovers();
        metrics.inc_unreachable();
        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.failovers, 1);
        assert_eq!(snap.unreachable, 1);
        assert_eq!(snap.successes, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ClientMetrics::new();
        metrics.inc_timeouts();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"timeouts\":1"));
    }
}
