use std::sync::Arc;
use std::time::Duration;

use s5_conductor::sim::{DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD};
use s5_conductor::{
    ConductorClient, ConductorClientConfig, Executor, PoolConfig, RetryConfig, SimCluster,
};

use crate::context::{Capability, ExecutionContext};

pub(crate) fn client(cluster: &SimCluster) -> Arc<ConductorClient> {
    let config = ConductorClientConfig {
        retry: RetryConfig {
            max_attempts: 1,
            jitter: false,
            ..RetryConfig::default()
        },
        request_timeout: Duration::from_millis(200),
        call_timeout: Duration::from_secs(2),
        pool: PoolConfig {
            connect_timeout: Duration::from_millis(200),
            ..PoolConfig::default()
        },
        ..ConductorClientConfig::default()
    };
    Arc::new(ConductorClient::new(Arc::new(cluster.transport()), config))
}

pub(crate) fn admin(cluster: &SimCluster) -> ExecutionContext {
    ExecutionContext::new(
        Executor::new(DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD),
        cluster.addrs(),
        Capability::Admin,
    )
}

pub(crate) fn tenant(cluster: &SimCluster, name: &str, password: &str) -> ExecutionContext {
    ExecutionContext::new(
        Executor::new(name, password),
        cluster.addrs(),
        Capability::Tenant(name.to_string()),
    )
}
