//! Call deadlines for conductor requests.
//!
//! A deadline bounds an entire client call: connection acquisition, every retry and every
//! failover. Uses the tokio clock so tests can pause time.

use std::time::Duration;

use tokio::time::Instant;

/// Absolute point in time a call must finish by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    started: Instant,
}

impl Deadline {
    /// Creates a deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            at: now + timeout,
            started: now,
        }
    }

    /// Returns the remaining time, or `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if self.at > now {
            Some(self.at - now)
        } else {
            None
        }
    }

    /// Returns `true` if the deadline has expired.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// Time elapsed since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Caps `limit` to the remaining time.
    pub fn cap(&self, limit: Duration) -> Duration {
        self.remaining().map(|r| r.min(limit)).unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(100));
        assert!(!deadline.is_expired());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(deadline.is_expired());
        assert!(deadline.remaining().is_none());
        assert!(deadline.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap() {
        let deadline = Deadline::after(Duration::from_millis(100));
        assert_eq!(deadline.cap(Duration::from_secs(5)), Duration::from_millis(100));
        assert_eq!(deadline.cap(Duration::from_millis(10)), Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(deadline.cap(Duration::from_secs(5)), Duration::ZERO);
    }
}
