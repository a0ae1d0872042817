//! Per-conductor circuit breaker.
//!
//! A conductor that fails `failure_threshold` exchanges in a row is tripped: the client keeps
//! it in the failover order but tries it last. Once `open_duration` has passed the next call
//! may probe it again; the probe's outcome closes or re-trips the circuit.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Consecutive failures that trip a conductor.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
/// How long a tripped conductor stays at the back of the order, in milliseconds.
pub const DEFAULT_OPEN_DURATION_MS: u64 = 5_000;

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Conductor is tried in its configured position.
    Closed,
    /// Conductor is tried after all closed ones.
    Open,
    /// Probe allowed; the next outcome decides.
    HalfOpen,
}

/// Circuit breaker settings shared by every conductor in a pool.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Time before a tripped conductor may be probed.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_duration: Duration::from_millis(DEFAULT_OPEN_DURATION_MS),
        }
    }
}

#[derive(Debug)]
enum Phase {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Failure tracker for one conductor.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    phase: Mutex<Phase>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            phase: Mutex::new(Phase::Closed { failures: 0 }),
        }
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the conductor should be tried after the closed ones.
    ///
    /// A tripped circuit whose open period has elapsed moves to half-open and reports `false`.
    pub fn is_open(&self) -> bool {
        let mut phase = self.phase();
        match *phase {
            Phase::Open { since } if since.elapsed() >= self.config.open_duration => {
                *phase = Phase::HalfOpen;
                false
            }
            Phase::Open { .. } => true,
            _ => false,
        }
    }

    /// Records a clean exchange; closes the circuit.
    pub fn record_success(&self) {
        *self.phase() = Phase::Closed { failures: 0 };
    }

    /// Records a failed exchange.
    pub fn record_failure(&self) {
        let mut phase = self.phase();
        let trip = match *phase {
            Phase::Closed { failures } => {
                let failures = failures + 1;
                *phase = Phase::Closed { failures };
                failures >= self.config.failure_threshold
            }
            Phase::HalfOpen => true,
            Phase::Open { .. } => false,
        };
        if trip {
            *phase = Phase::Open {
                since: Instant::now(),
            };
        }
    }

    /// Current state, without advancing an expired open period.
    pub fn state(&self) -> CircuitState {
        match *self.phase() {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen => CircuitState::HalfOpen,
        }
    }

    /// Failures since the last success while closed; zero otherwise.
    pub fn consecutive_failures(&self) -> u32 {
        match *self.phase() {
            Phase::Closed { failures } => failures,
            _ => 0,
        }
    }
}
