//! Failover client for the conductor cluster.
//!
//! A call walks an ordered list of candidate conductors. Transient transport failures are
//! retried against the same conductor with exponential backoff and then fail over to the
//! next one; anything a conductor answers is final. The whole call, including connection
//! acquisition, is bounded by one [`Deadline`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::deadline::Deadline;
use crate::error::{ClientError, TransportError};
use crate::message::{Envelope, Executor, Reply, Request, Response};
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::retry::{next_step, NextStep, RetryConfig};
use crate::transport::ConductorTransport;

/// Order in which candidate conductors are tried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverOrder {
    /// Configured order.
    #[default]
    Fixed,
    /// Shuffled for every call.
    Randomized,
}

/// Configuration for [`ConductorClient`].
#[derive(Debug, Clone)]
pub struct ConductorClientConfig {
    /// Per-conductor retry policy.
    pub retry: RetryConfig,
    /// Time allowed for one request/reply exchange.
    pub request_timeout: Duration,
    /// Deadline for a whole call when the caller gives none.
    pub call_timeout: Duration,
    /// Candidate ordering.
    pub order: FailoverOrder,
    /// Connection pool settings.
    pub pool: PoolConfig,
}

impl Default for ConductorClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            order: FailoverOrder::Fixed,
            pool: PoolConfig::default(),
        }
    }
}

/// Successful result of [`ConductorClient::call`].
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Response from the conductor.
    pub response: Response,
    /// Conductor that answered.
    pub conductor: String,
    /// An earlier delivery of the same request was sent but never answered.
    pub ambiguous: bool,
}

/// Why a single exchange with a conductor failed.
struct AttemptFailure {
    error: TransportError,
    /// The request left this client before the failure.
    sent: bool,
}

impl AttemptFailure {
    fn before_send(error: TransportError) -> Self {
        Self { error, sent: false }
    }

    fn after_send(error: TransportError) -> Self {
        Self { error, sent: true }
    }
}

/// Client that sends control-plane requests to a conductor cluster.
pub struct ConductorClient {
    config: ConductorClientConfig,
    pool: ConnectionPool,
    metrics: Arc<ClientMetrics>,
    next_request_id: AtomicU64,
}

impl ConductorClient {
    /// Creates a client that connects through `transport`.
    pub fn new(transport: Arc<dyn ConductorTransport>, config: ConductorClientConfig) -> Self {
        let metrics = Arc::new(ClientMetrics::new());
        let pool = ConnectionPool::new(config.pool.clone(), transport, metrics.clone());
        Self {
            config,
            pool,
            metrics,
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Client configuration.
    pub fn config(&self) -> &ConductorClientConfig {
        &self.config
    }

    /// Connection pool shared by all calls.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Snapshot of the client counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Candidate order for one call: configured or shuffled, open circuits last.
    pub fn candidates(&self, addrs: &[String]) -> Vec<String> {
        let mut order = addrs.to_vec();
        if self.config.order == FailoverOrder::Randomized {
            order.shuffle(&mut rand::thread_rng());
        }
        let (mut healthy, open): (Vec<String>, Vec<String>) =
            order.into_iter().partition(|addr| !self.pool.is_open(addr));
        healthy.extend(open);
        healthy
    }

    /// Sends `request` to the first conductor in `addrs` that answers.
    ///
    /// `timeout` bounds the whole call; `None` uses the configured call timeout.
    pub async fn call(
        &self,
        addrs: &[String],
        executor: &Executor,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<CallOutcome, ClientError> {
        self.metrics.inc_requests();
        let name = request.name();

        if addrs.is_empty() {
            self.metrics.inc_unreachable();
            return Err(ClientError::Unreachable {
                tried: Vec::new(),
                last_error: "no conductor addresses configured".to_string(),
                ambiguous: false,
            });
        }

        let deadline = Deadline::after(timeout.unwrap_or(self.config.call_timeout));
        let envelope = Envelope {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            executor: executor.clone(),
            request,
        };

        let mut tried = Vec::new();
        let mut last_error = String::new();
        let mut ambiguous = false;
        let attempts = self.config.retry.max_attempts.max(1);

        for (index, addr) in self.candidates(addrs).into_iter().enumerate() {
            if index > 0 {
                self.metrics.inc_failovers();
                warn!(
                    request = name,
                    addr = %addr,
                    last_error = %last_error,
                    "failing over to next conductor"
                );
            }
            tried.push(addr.clone());

            for attempt in 0..attempts {
                if attempt > 0 {
                    let backoff = self.config.retry.backoff(attempt - 1);
                    if deadline.cap(backoff) < backoff {
                        debug!(request = name, addr = %addr, ?backoff, "no time left to retry conductor");
                        break;
                    }
                    self.metrics.inc_retries();
                    debug!(request = name, addr = %addr, attempt, ?backoff, "retrying conductor");
                    tokio::time::sleep(backoff).await;
                }
                if deadline.is_expired() {
                    return Err(self.deadline_exceeded(&deadline, ambiguous));
                }

                match self.exchange(&addr, &envelope, &deadline).await {
                    Ok(reply) => {
                        self.pool.record_success(&addr);
                        return match reply.result {
                            Ok(response) => {
                                self.metrics.inc_successes();
                                debug!(
                                    request = name,
                                    request_id = envelope.request_id,
                                    addr = %addr,
                                    "conductor answered"
                                );
                                Ok(CallOutcome {
                                    response,
                                    conductor: addr,
                                    ambiguous,
                                })
                            }
                            Err(error) => {
                                self.metrics.inc_rejections();
                                debug!(request = name, addr = %addr, error = %error, "conductor rejected request");
                                Err(ClientError::Rejected { error, ambiguous })
                            }
                        };
                    }
                    Err(failure) => {
                        if failure.sent {
                            ambiguous = true;
                        }
                        match failure.error {
                            TransportError::OutOfMemory { .. } => {
                                return Err(ClientError::OutOfMemory(failure.error.to_string()));
                            }
                            TransportError::PayloadTooLarge { .. } if !failure.sent => {
                                return Err(ClientError::Encoding(failure.error.to_string()));
                            }
                            TransportError::RequestTimeout { .. }
                            | TransportError::ConnectionTimeout { .. } => {
                                self.metrics.inc_timeouts();
                            }
                            _ => {}
                        }
                        self.pool.record_failure(&addr);
                        if deadline.is_expired() {
                            return Err(self.deadline_exceeded(&deadline, ambiguous));
                        }
                        debug!(
                            request = name,
                            addr = %addr,
                            error = %failure.error,
                            sent = failure.sent,
                            "conductor exchange failed"
                        );
                        let step = next_step(&failure.error);
                        last_error = failure.error.to_string();
                        if step == NextStep::NextConductor {
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.inc_unreachable();
        warn!(request = name, tried = ?tried, last_error = %last_error, "no conductor reachable");
        Err(ClientError::Unreachable {
            tried,
            last_error,
            ambiguous,
        })
    }

    /// One request/reply exchange with `addr`.
    ///
    /// The connection goes back to the pool only when a matching reply arrived.
    async fn exchange(
        &self,
        addr: &str,
        envelope: &Envelope,
        deadline: &Deadline,
    ) -> Result<Reply, AttemptFailure> {
        let connect_wait = deadline.cap(self.config.pool.connect_timeout);
        let mut pooled = self
            .pool
            .acquire(addr, connect_wait)
            .await
            .map_err(AttemptFailure::before_send)?;
        let conn = pooled.conn().map_err(AttemptFailure::before_send)?;

        let budget = deadline.cap(self.config.request_timeout);
        let timed_out = || TransportError::RequestTimeout {
            request_id: envelope.request_id,
            timeout_ms: budget.as_millis() as u64,
        };
        let started = tokio::time::Instant::now();

        match tokio::time::timeout(budget, conn.send(envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(AttemptFailure::before_send(e)),
            Err(_) => return Err(AttemptFailure::after_send(timed_out())),
        }

        let left = budget.saturating_sub(started.elapsed());
        let reply = match tokio::time::timeout(left, conn.recv()).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(AttemptFailure::after_send(e)),
            Err(_) => return Err(AttemptFailure::after_send(timed_out())),
        };

        if reply.request_id != envelope.request_id {
            return Err(AttemptFailure::after_send(TransportError::ReplyMismatch {
                expected: envelope.request_id,
                got: reply.request_id,
            }));
        }

        pooled.release();
        Ok(reply)
    }

    fn deadline_exceeded(&self, deadline: &Deadline, ambiguous: bool) -> ClientError {
        self.metrics.inc_deadline_exceeded();
        let elapsed_ms = deadline.elapsed().as_millis() as u64;
        warn!(elapsed_ms, ambiguous, "conductor call deadline exceeded");
        ClientError::DeadlineExceeded {
            elapsed_ms,
            ambiguous,
        }
    }
}

impl std::fmt::Debug for ConductorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConductorClient")
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorKind, ExecutorRole, Quota};
    use crate::sim::{SimCluster, DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD};

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn admin() -> Executor {
        Executor::new(DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD)
    }

    fn fast_config() -> ConductorClientConfig {
        ConductorClientConfig {
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                jitter: false,
            },
            request_timeout: Duration::from_millis(200),
            call_timeout: Duration::from_secs(5),
            order: FailoverOrder::Fixed,
            pool: PoolConfig {
                connect_timeout: Duration::from_millis(200),
                ..PoolConfig::default()
            },
        }
    }

    fn client_for(sim: &SimCluster) -> ConductorClient {
        ConductorClient::new(Arc::new(sim.transport()), fast_config())
    }

    #[tokio::test]
    async fn test_call_first_conductor() {
        let sim = SimCluster::new(&["10.0.0.1", "10.0.0.2"]);
        let client = client_for(&sim);
        let out = client
            .call(&sim.addrs(), &admin(), Request::Login, None)
            .await
            .unwrap();
        assert_eq!(out.response, Response::LoggedIn(ExecutorRole::Admin));
        assert_eq!(out.conductor, "10.0.0.1");
        assert!(!out.ambiguous);
        assert_eq!(client.metrics().successes, 1);
    }

    #[tokio::test]
    async fn test_empty_address_list_is_unreachable() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        let client = client_for(&sim);
        let err = client
            .call(&[], &admin(), Request::ListStores, None)
            .await
            .unwrap_err();
        match err {
            ClientError::Unreachable { tried, .. } => assert!(tried.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fails_over_to_next_conductor() {
        let sim = SimCluster::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        sim.stop("10.0.0.1");
        let client = client_for(&sim);
        let out = client
            .call(&sim.addrs(), &admin(), Request::ListStores, None)
            .await
            .unwrap();
        assert_eq!(out.conductor, "10.0.0.2");
        assert_eq!(client.metrics().failovers, 1);
    }

    #[tokio::test]
    async fn test_all_down_is_unreachable_with_tried_list() {
        let sim = SimCluster::new(&["10.0.0.1", "10.0.0.2"]);
        sim.stop("10.0.0.1");
        sim.stop("10.0.0.2");
        let client = client_for(&sim);
        let err = client
            .call(&sim.addrs(), &admin(), Request::ListStores, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        match err {
            ClientError::Unreachable { tried, .. } => {
                assert_eq!(tried, addrs(&["10.0.0.1", "10.0.0.2"]))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_is_not_failed_over() {
        let sim = SimCluster::new(&["10.0.0.1", "10.0.0.2"]);
        let client = client_for(&sim);
        let err = client
            .call(
                &sim.addrs(),
                &admin(),
                Request::StatTenant {
                    name: "ghost".to_string(),
                },
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let snap = client.metrics();
        assert_eq!(snap.failovers, 0);
        assert_eq!(snap.retries, 0);
        assert_eq!(snap.rejections, 1);
    }

    #[tokio::test]
    async fn test_dropped_reply_marks_outcome_ambiguous() {
        let sim = SimCluster::new(&["10.0.0.1", "10.0.0.2"]);
        sim.drop_replies("10.0.0.1", 2);
        let client = client_for(&sim);
        let create = Request::CreateTenant {
            name: "acme".to_string(),
            password: "pw".to_string(),
            quota: Quota::new(1 << 30, 1000, 1 << 20),
        };
        let err = client
            .call(&sim.addrs(), &admin(), create, None)
            .await
            .unwrap_err();
        // The first delivery was applied; the redelivery to the next conductor collides.
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(err.is_ambiguous());
        assert!(client.metrics().timeouts >= 1);
    }

    #[tokio::test]
    async fn test_backoff_past_deadline_fails_over_instead() {
        let sim = SimCluster::new(&["10.0.0.1", "10.0.0.2"]);
        sim.drop_replies("10.0.0.1", 10);
        let config = ConductorClientConfig {
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(400),
                max_backoff: Duration::from_millis(400),
                jitter: false,
            },
            request_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_millis(800),
            ..fast_config()
        };
        let client = ConductorClient::new(Arc::new(sim.transport()), config);
        let out = client
            .call(&sim.addrs(), &admin(), Request::ListStores, None)
            .await
            .unwrap();
        // About 300ms remain after the first timeout: too little for the 400ms backoff.
        assert_eq!(out.conductor, "10.0.0.2");
        let metrics = client.metrics();
        assert_eq!(metrics.retries, 0);
        assert_eq!(metrics.failovers, 1);
        assert_eq!(metrics.deadline_exceeded, 0);
    }

    #[tokio::test]
    async fn test_deadline_bounds_the_call() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        sim.drop_replies("10.0.0.1", 10);
        let client = client_for(&sim);
        let err = client
            .call(
                &sim.addrs(),
                &admin(),
                Request::ListStores,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(client.metrics().deadline_exceeded, 1);
        // The abandoned connection released its permit.
        assert_eq!(
            client.pool().available_permits("10.0.0.1"),
            PoolConfig::default().max_connections_per_conductor
        );
    }

    #[tokio::test]
    async fn test_open_circuit_moves_conductor_last() {
        let sim = SimCluster::new(&["10.0.0.1", "10.0.0.2"]);
        let client = client_for(&sim);
        for _ in 0..crate::circuitbreaker::DEFAULT_FAILURE_THRESHOLD {
            client.pool().record_failure("10.0.0.1");
        }
        let order = client.candidates(&sim.addrs());
        assert_eq!(order, addrs(&["10.0.0.2", "10.0.0.1"]));
    }

    #[tokio::test]
    async fn test_randomized_order_keeps_every_candidate() {
        let sim = SimCluster::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let config = ConductorClientConfig {
            order: FailoverOrder::Randomized,
            ..fast_config()
        };
        let client = ConductorClient::new(Arc::new(sim.transport()), config);
        let mut order = client.candidates(&sim.addrs());
        order.sort();
        assert_eq!(order, sim.addrs());
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        let client = client_for(&sim);
        for _ in 0..3 {
            client
                .call(&sim.addrs(), &admin(), Request::ListStores, None)
                .await
                .unwrap();
        }
        assert_eq!(client.metrics().connections_opened, 1);
    }
}
