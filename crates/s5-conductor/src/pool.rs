//! Connection pool for conductor connections.
//!
//! Each conductor address gets a semaphore bounding concurrent connections, a small list of
//! idle connections and a circuit breaker. A connection goes back to the idle list only
//! after a clean request/reply exchange; anything else drops it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{Result, TransportError};
use crate::metrics::ClientMetrics;
use crate::transport::{ConductorConnection, ConductorTransport};

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent connections per conductor.
    pub max_connections_per_conductor: usize,
    /// Maximum idle connections kept per conductor.
    pub max_idle_per_conductor: usize,
    /// Upper bound on waiting for a permit plus establishing a connection.
    pub connect_timeout: Duration,
    /// Circuit breaker settings applied to every conductor.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_conductor: 4,
            max_idle_per_conductor: 2,
            connect_timeout: Duration::from_secs(2),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

struct Endpoint {
    idle: Mutex<Vec<Box<dyn ConductorConnection>>>,
    permits: Arc<Semaphore>,
    breaker: CircuitBreaker,
}

impl Endpoint {
    fn idle(&self) -> MutexGuard<'_, Vec<Box<dyn ConductorConnection>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A checked-out connection.
///
/// Holding it holds one of the conductor's connection permits. Call [`release`] after a
/// clean exchange to return the connection to the idle list; dropping it discards the
/// connection and frees the permit.
///
/// [`release`]: PooledConnection::release
pub struct PooledConnection {
    conn: Option<Box<dyn ConductorConnection>>,
    endpoint: Arc<Endpoint>,
    max_idle: usize,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// The underlying connection.
    pub fn conn(&mut self) -> Result<&mut (dyn ConductorConnection + 'static)> {
        self.conn.as_deref_mut().ok_or(TransportError::NotConnected)
    }

    /// Returns the connection to the idle list.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self.endpoint.idle();
            if idle.len() < self.max_idle {
                idle.push(conn);
            }
        }
    }
}

/// Pool of connections to every known conductor.
pub struct ConnectionPool {
    config: PoolConfig,
    transport: Arc<dyn ConductorTransport>,
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
    metrics: Arc<ClientMetrics>,
}

impl ConnectionPool {
    /// Creates a pool that opens connections through `transport`.
    pub fn new(
        config: PoolConfig,
        transport: Arc<dyn ConductorTransport>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            config,
            transport,
            endpoints: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    fn endpoint(&self, addr: &str) -> Arc<Endpoint> {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints
            .entry(addr.to_string())
            .or_insert_with(|| {
                debug!(addr = addr, "registering conductor endpoint");
                Arc::new(Endpoint {
                    idle: Mutex::new(Vec::new()),
                    permits: Arc::new(Semaphore::new(self.config.max_connections_per_conductor)),
                    breaker: CircuitBreaker::new(self.config.circuit_breaker.clone()),
                })
            })
            .clone()
    }

    /// Checks out a connection to `addr`, waiting at most `wait`.
    pub async fn acquire(&self, addr: &str, wait: Duration) -> Result<PooledConnection> {
        let started = Instant::now();
        let endpoint = self.endpoint(addr);
        let timeout_err = || TransportError::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms: wait.as_millis() as u64,
        };

        let permit = tokio::time::timeout(wait, endpoint.permits.clone().acquire_owned())
            .await
            .map_err(|_| timeout_err())?
            .map_err(|_| TransportError::NotConnected)?;

        let reused = endpoint.idle().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let remaining = wait.saturating_sub(started.elapsed());
                let conn = tokio::time::timeout(remaining, self.transport.connect(addr))
                    .await
                    .map_err(|_| timeout_err())??;
                self.metrics.inc_connections_opened();
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            endpoint,
            max_idle: self.config.max_idle_per_conductor,
            _permit: permit,
        })
    }

    /// Records a clean exchange with `addr`.
    pub fn record_success(&self, addr: &str) {
        self.endpoint(addr).breaker.record_success();
    }

    /// Records a transport failure with `addr` and drops its idle connections.
    pub fn record_failure(&self, addr: &str) {
        let endpoint = self.endpoint(addr);
        endpoint.breaker.record_failure();
        let dropped = std::mem::take(&mut *endpoint.idle());
        if !dropped.is_empty() {
            debug!(addr = addr, dropped = dropped.len(), "dropped idle connections");
        }
    }

    /// Whether the circuit for `addr` is open.
    pub fn is_open(&self, addr: &str) -> bool {
        self.endpoint(addr).breaker.is_open()
    }

    /// Circuit state of `addr`.
    pub fn circuit_state(&self, addr: &str) -> CircuitState {
        self.endpoint(addr).breaker.state()
    }

    /// Number of idle connections kept for `addr`.
    pub fn idle_count(&self, addr: &str) -> usize {
        self.endpoint(addr).idle().len()
    }

    /// Number of permits currently free for `addr`.
    pub fn available_permits(&self, addr: &str) -> usize {
        self.endpoint(addr).permits.available_permits()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Envelope, Reply, Response};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoConn {
        addr: String,
        last: Option<u64>,
    }

    #[async_trait]
    impl ConductorConnection for EchoConn {
        async fn send(&mut self, envelope: &Envelope) -> Result<()> {
            self.last = Some(envelope.request_id);
            Ok(())
        }

        async fn recv(&mut self) -> Result<Reply> {
            let id = self.last.take().ok_or(TransportError::NotConnected)?;
            Ok(Reply::ok(id, Response::Done))
        }

        fn peer_addr(&self) -> &str {
            &self.addr
        }
    }

    #[derive(Default)]
    struct CountingTransport {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl ConductorTransport for CountingTransport {
        async fn connect(&self, addr: &str) -> Result<Box<dyn ConductorConnection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EchoConn {
                addr: addr.to_string(),
                last: None,
            }))
        }
    }

    fn pool(transport: Arc<CountingTransport>, max_conns: usize) -> ConnectionPool {
        let config = PoolConfig {
            max_connections_per_conductor: max_conns,
            connect_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        ConnectionPool::new(config, transport, Arc::new(ClientMetrics::new()))
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let transport = Arc::new(CountingTransport::default());
        let pool = pool(transport.clone(), 2);
        let conn = pool.acquire("c1", Duration::from_millis(50)).await.unwrap();
        conn.release();
        assert_eq!(pool.idle_count("c1"), 1);
        let _conn = pool.acquire("c1", Duration::from_millis(50)).await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_discarded() {
        let transport = Arc::new(CountingTransport::default());
        let pool = pool(transport.clone(), 2);
        let conn = pool.acquire("c1", Duration::from_millis(50)).await.unwrap();
        drop(conn);
        assert_eq!(pool.idle_count("c1"), 0);
        assert_eq!(pool.available_permits("c1"), 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let transport = Arc::new(CountingTransport::default());
        let pool = pool(transport, 1);
        let _held = pool.acquire("c1", Duration::from_millis(50)).await.unwrap();
        let err = pool.acquire("c1", Duration::from_millis(20)).await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionTimeout { .. }));
    }

    #[tokio::test]
    async fn test_failure_drops_idle_and_opens_circuit() {
        let transport = Arc::new(CountingTransport::default());
        let pool = pool(transport, 2);
        pool.acquire("c1", Duration::from_millis(50))
            .await
            .unwrap()
            .release();
        for _ in 0..crate::circuitbreaker::DEFAULT_FAILURE_THRESHOLD {
            pool.record_failure("c1");
        }
        assert_eq!(pool.idle_count("c1"), 0);
        assert!(pool.is_open("c1"));
        pool.record_success("c1");
        assert_eq!(pool.circuit_state("c1"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_exchange_through_pooled_connection() {
        let transport = Arc::new(CountingTransport::default());
        let pool = pool(transport, 2);
        let mut pooled = pool.acquire("c1", Duration::from_millis(50)).await.unwrap();
        let conn = pooled.conn().unwrap();
        conn.send(&Envelope {
            request_id: 5,
            executor: crate::message::Executor::new("a", "b"),
            request: crate::message::Request::ListStores,
        })
        .await
        .unwrap();
        let reply = conn.recv().await.unwrap();
        assert_eq!(reply.request_id, 5);
        assert_eq!(conn.peer_addr(), "c1");
    }
}
