//! Management configuration, loaded from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use s5_conductor::{
    CircuitBreakerConfig, ConductorClientConfig, FailoverOrder, PoolConfig, RetryConfig,
};

/// Settings of the management plane; every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    /// Conductor addresses used when a login names none.
    pub conductors: Vec<String>,
    /// Wait for one reply.
    pub request_timeout_ms: u64,
    /// Default deadline of a whole call, failovers included.
    pub call_timeout_ms: u64,
    /// Wait for a connection to a conductor.
    pub connect_timeout_ms: u64,
    /// Exchanges with one conductor before failing over.
    pub attempts_per_conductor: u32,
    /// Fixed or randomized conductor order.
    pub failover_order: FailoverOrder,
    /// Concurrent connections per conductor.
    pub max_connections_per_conductor: usize,
    /// Idle connections kept per conductor.
    pub max_idle_per_conductor: usize,
    /// First retry delay.
    pub initial_backoff_ms: u64,
    /// Largest retry delay.
    pub max_backoff_ms: u64,
    /// Consecutive failures that move a conductor to the back of the order.
    pub circuit_failure_threshold: u32,
    /// How long a failing conductor stays at the back.
    pub circuit_open_ms: u64,
    /// Age below which cached occupancy is trusted.
    pub cache_ttl_secs: u64,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            conductors: Vec::new(),
            request_timeout_ms: 5_000,
            call_timeout_ms: 30_000,
            connect_timeout_ms: 2_000,
            attempts_per_conductor: 2,
            failover_order: FailoverOrder::Fixed,
            max_connections_per_conductor: 4,
            max_idle_per_conductor: 2,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            circuit_failure_threshold: 3,
            circuit_open_ms: 5_000,
            cache_ttl_secs: 10,
        }
    }
}

impl MgmtConfig {
    /// Loads a `.toml` or `.json` file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: MgmtConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: MgmtConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Conductor client settings derived from this configuration.
    pub fn client_config(&self) -> ConductorClientConfig {
        ConductorClientConfig {
            retry: RetryConfig {
                max_attempts: self.attempts_per_conductor.max(1),
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                ..RetryConfig::default()
            },
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            order: self.failover_order,
            pool: PoolConfig {
                max_connections_per_conductor: self.max_connections_per_conductor.max(1),
                max_idle_per_conductor: self.max_idle_per_conductor,
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: self.circuit_failure_threshold.max(1),
                    open_duration: Duration::from_millis(self.circuit_open_ms),
                },
            },
        }
    }

    /// Freshness limit of cached listings and occupancy.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
