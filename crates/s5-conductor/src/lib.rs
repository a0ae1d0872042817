#![warn(missing_docs)]

//! S5 control plane: conductor wire protocol, failover client, connection pool and an
//! in-memory conductor cluster.

pub mod circuitbreaker;
pub mod client;
pub mod deadline;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod sim;
pub mod tcp;
pub mod transport;

pub use circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{CallOutcome, ConductorClient, ConductorClientConfig, FailoverOrder};
pub use deadline::Deadline;
pub use error::{ClientError, Result, TransportError};
pub use message::{
    conductor_ip, BccInfo, ClientLinkFilter, ClientLinkRecord, ClusterCapacity, ComponentStatus,
    ConductorInfo, ConductorRole, Envelope, ErrorKind, Executor, ExecutorRole, FanInfo,
    HostPortInfo, PowerInfo, Quota, RealtimeStats, RemoteError, Reply, Request, Response, RgeInfo,
    StatsScope, StoreDetail, StoreRecord, StoreStatus, TenantRecord, TraySetInfo, TrayInfo,
    VolumeRecord,
};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use retry::{NextStep, RetryConfig};
pub use server::{ConductorServer, ConductorService};
pub use sim::{SensorProbe, SimCluster, SimConductor, SimTransport, StaticSensors};
pub use tcp::{FramedStream, TcpOptions};
pub use transport::{ConductorConnection, ConductorTransport, TcpConductorTransport};
