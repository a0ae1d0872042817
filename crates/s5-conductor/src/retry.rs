//! Same-conductor retry policy.
//!
//! A transient failure is retried on the same conductor with doubling backoff, up to
//! `max_attempts` exchanges, before the client fails over to the next conductor.

use std::time::Duration;

use rand::Rng;

use crate::error::TransportError;

/// Backoff schedule for retries on one conductor.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Exchanges per conductor, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Add up to half the delay again at random.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based): `initial_backoff * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay = 2u32
            .checked_pow(retry)
            .and_then(|factor| self.initial_backoff.checked_mul(factor))
            .map_or(self.max_backoff, |d| d.min(self.max_backoff));
        if !self.jitter {
            return delay;
        }
        let half = delay.as_millis() as u64 / 2;
        if half == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=half))
    }
}

/// Where the client goes after a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Back off and try the same conductor again.
    SameConductor,
    /// Move on to the next conductor in the order.
    NextConductor,
}

/// Classifies a failed exchange.
///
/// Timeouts, resets and I/O errors may clear on their own. A refused connection, a broken
/// stream or a malformed frame will not get better by asking the same conductor again.
pub fn next_step(error: &TransportError) -> NextStep {
    match error {
        TransportError::ConnectionReset
        | TransportError::ConnectionTimeout { .. }
        | TransportError::RequestTimeout { .. }
        | TransportError::IoError(_) => NextStep::SameConductor,
        _ => NextStep::NextConductor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let config = exact();
        let delays: Vec<_> = (0..4).map(|r| config.backoff(r).as_millis()).collect();
        assert_eq!(delays, vec![50, 100, 200, 400]);
    }

    #[test]
    fn test_backoff_saturates_at_cap() {
        let config = RetryConfig {
            max_backoff: Duration::from_millis(300),
            ..exact()
        };
        assert_eq!(config.backoff(3), Duration::from_millis(300));
        assert_eq!(config.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_within_half() {
        let config = RetryConfig::default();
        for _ in 0..50 {
            let ms = config.backoff(1).as_millis();
            assert!((100..=150).contains(&ms), "{}", ms);
        }
    }

    #[test]
    fn test_transient_errors_stay_on_conductor() {
        let timeout = TransportError::RequestTimeout {
            request_id: 1,
            timeout_ms: 5000,
        };
        assert_eq!(next_step(&timeout), NextStep::SameConductor);
        assert_eq!(
            next_step(&TransportError::ConnectionReset),
            NextStep::SameConductor
        );
    }

    #[test]
    fn test_hard_errors_fail_over() {
        let refused = TransportError::ConnectionRefused {
            addr: "10.0.0.1:49180".to_string(),
        };
        assert_eq!(next_step(&refused), NextStep::NextConductor);
        let garbled = TransportError::InvalidFrame {
            reason: "short header".to_string(),
        };
        assert_eq!(next_step(&garbled), NextStep::NextConductor);
        assert_eq!(next_step(&TransportError::NotConnected), NextStep::NextConductor);
    }
}
