//! Entry point wiring the shared conductor client into the management components.

use std::sync::Arc;
use std::time::Duration;

use s5_conductor::{
    ConductorClient, ConductorTransport, Executor, ExecutorRole, MetricsSnapshot, Request,
    Response, TcpConductorTransport, TcpOptions,
};
use tracing::info;

use crate::config::MgmtConfig;
use crate::context::{unexpected, Capability, ExecutionContext};
use crate::controller::ClusterController;
use crate::error::Result;
use crate::quota::QuotaLedger;
use crate::telemetry::TelemetryAggregator;
use crate::topology::TopologyStore;
use crate::validate;

/// Management plane facade: one conductor client shared by every component.
pub struct Manager {
    config: MgmtConfig,
    client: Arc<ConductorClient>,
    topology: Arc<TopologyStore>,
    ledger: Arc<QuotaLedger>,
    controller: ClusterController,
    telemetry: TelemetryAggregator,
}

impl Manager {
    /// Builds the components on top of `transport`.
    pub fn new(config: MgmtConfig, transport: Arc<dyn ConductorTransport>) -> Self {
        let client = Arc::new(ConductorClient::new(transport, config.client_config()));
        let topology = Arc::new(TopologyStore::new(client.clone()));
        let ledger = Arc::new(QuotaLedger::new(client.clone()));
        let controller = ClusterController::new(
            client.clone(),
            topology.clone(),
            ledger.clone(),
            config.cache_ttl(),
        );
        let telemetry = TelemetryAggregator::new(client.clone());
        Self {
            config,
            client,
            topology,
            ledger,
            controller,
            telemetry,
        }
    }

    /// Manager talking to conductors over TCP.
    pub fn tcp(config: MgmtConfig) -> Self {
        let transport = TcpConductorTransport::with_options(TcpOptions {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            ..TcpOptions::default()
        });
        Self::new(config, Arc::new(transport))
    }

    /// Authenticates `name` and returns the context for subsequent calls.
    ///
    /// An empty `conductors` list falls back to the configured conductors.
    pub async fn login(
        &self,
        name: &str,
        password: &str,
        conductors: &[String],
    ) -> Result<ExecutionContext> {
        validate::name("executor", name)?;
        validate::password("executor", password)?;
        let conductors = if conductors.is_empty() {
            self.config.conductors.clone()
        } else {
            conductors.to_vec()
        };
        for addr in &conductors {
            validate::conductor_addr(addr)?;
        }

        let executor = Executor::new(name, password);
        let outcome = self
            .client
            .call(&conductors, &executor, Request::Login, None)
            .await?;
        let capability = match outcome.response {
            Response::LoggedIn(ExecutorRole::Admin) => Capability::Admin,
            Response::LoggedIn(ExecutorRole::Tenant) => Capability::Tenant(name.to_string()),
            other => return Err(unexpected("login", other)),
        };
        info!(executor = %name, capability = ?capability, conductor = %outcome.conductor, "logged in");
        Ok(ExecutionContext::new(executor, conductors, capability))
    }

    /// Configuration the manager was built from.
    pub fn config(&self) -> &MgmtConfig {
        &self.config
    }

    /// Topology store.
    pub fn topology(&self) -> &TopologyStore {
        &self.topology
    }

    /// Quota ledger.
    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Cluster controller.
    pub fn controller(&self) -> &ClusterController {
        &self.controller
    }

    /// Telemetry aggregator.
    pub fn telemetry(&self) -> &TelemetryAggregator {
        &self.telemetry
    }

    /// Conductor client counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.client.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s5_conductor::sim::{DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD};
    use s5_conductor::{ErrorKind, SimCluster};

    fn manager(cluster: &SimCluster) -> Manager {
        let config = MgmtConfig {
            conductors: cluster.addrs(),
            request_timeout_ms: 200,
            connect_timeout_ms: 200,
            attempts_per_conductor: 1,
            ..MgmtConfig::default()
        };
        Manager::new(config, Arc::new(cluster.transport()))
    }

    #[tokio::test]
    async fn test_admin_login_uses_configured_conductors() {
        let cluster = SimCluster::new(&["10.0.0.1", "10.0.0.2"]);
        let manager = manager(&cluster);
        let ctx = manager
            .login(DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD, &[])
            .await
            .unwrap();
        assert!(ctx.is_admin());
        assert_eq!(ctx.conductors(), cluster.addrs().as_slice());
        assert_eq!(manager.metrics().requests, 1);
    }

    #[tokio::test]
    async fn test_tenant_login() {
        let cluster = SimCluster::new(&["10.0.0.1"]);
        let manager = manager(&cluster);
        let admin = manager
            .login(DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD, &[])
            .await
            .unwrap();
        manager
            .ledger()
            .create_tenant(&admin, "acme", "pw", s5_conductor::Quota::default())
            .await
            .unwrap();
        let ctx = manager.login("acme", "pw", &[]).await.unwrap();
        assert_eq!(ctx.capability(), &Capability::Tenant("acme".to_string()));
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let cluster = SimCluster::new(&["10.0.0.1"]);
        let err = manager(&cluster)
            .login("admin", "wrong", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_malformed_conductor_address() {
        let cluster = SimCluster::new(&["10.0.0.1"]);
        let err = manager(&cluster)
            .login("admin", "s5admin", &["conductor-a".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_no_conductors_is_unreachable() {
        let cluster = SimCluster::new(&["10.0.0.1"]);
        let manager = Manager::new(MgmtConfig::default(), Arc::new(cluster.transport()));
        let err = manager
            .login(DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }
}
