//! Shared fixture: a simulated conductor cluster behind a management facade.

#![allow(dead_code)]

use std::sync::Arc;

use s5_conductor::sim::{DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD};
use s5_conductor::{ClientLinkRecord, SimCluster};
use s5_mgmt::{ExecutionContext, Manager, MgmtConfig};

pub const CONDUCTORS: [&str; 3] = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];

/// Timeouts short enough that failover tests finish quickly.
pub fn fast_config(conductors: Vec<String>) -> MgmtConfig {
    MgmtConfig {
        conductors,
        request_timeout_ms: 200,
        call_timeout_ms: 3_000,
        connect_timeout_ms: 200,
        attempts_per_conductor: 1,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        ..MgmtConfig::default()
    }
}

pub struct TestCluster {
    pub sim: SimCluster,
    pub manager: Manager,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_conductors(&CONDUCTORS)
    }

    pub fn with_conductors(conductors: &[&str]) -> Self {
        let sim = SimCluster::new(conductors);
        let manager = Manager::new(fast_config(sim.addrs()), Arc::new(sim.transport()));
        Self { sim, manager }
    }

    pub async fn admin(&self) -> ExecutionContext {
        self.manager
            .login(DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD, &[])
            .await
            .expect("admin login")
    }

    pub async fn login(&self, name: &str, password: &str) -> ExecutionContext {
        self.manager
            .login(name, password, &[])
            .await
            .expect("tenant login")
    }
}

pub fn link(client_port: u16, tenant: &str, volume: &str, store: &str) -> ClientLinkRecord {
    ClientLinkRecord {
        client_ip: "10.2.0.7".to_string(),
        client_port,
        nic_ip: "10.1.0.1".to_string(),
        nic_port: 49162,
        tenant: tenant.to_string(),
        volume: volume.to_string(),
        store: store.to_string(),
    }
}
