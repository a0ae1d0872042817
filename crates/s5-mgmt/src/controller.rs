//! Cluster controller: guarded deletions, admins and store power/fan commands.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use s5_conductor::{
    ClientLinkFilter, ClientLinkRecord, ClusterCapacity, ConductorClient, ConductorRole,
    ErrorKind, Executor, ExecutorRole, Request, Response, VolumeRecord,
};
use tracing::{debug, info};

use crate::context::{ambiguous_rejection, unexpected, ExecutionContext, Scope};
use crate::error::{MgmtError, Result};
use crate::listing::materialize;
use crate::quota::QuotaLedger;
use crate::topology::TopologyStore;
use crate::validate;

/// Client links and volume placement observed at one point in time.
#[derive(Debug, Clone)]
pub struct OccupancySnapshot {
    /// Every client link in the cluster.
    pub links: Vec<ClientLinkRecord>,
    /// Every volume with its replica placement.
    pub volumes: Vec<VolumeRecord>,
    /// When the listings were fetched.
    pub taken_at: Instant,
}

impl OccupancySnapshot {
    /// Time since the snapshot was taken.
    pub fn age(&self) -> Duration {
        self.taken_at.elapsed()
    }

    /// Why `store` cannot be removed, if anything prevents it.
    pub fn blocks_removal_of(&self, store: &str) -> Option<String> {
        let links = self.links.iter().filter(|l| l.store == store).count();
        if links > 0 {
            return Some(format!("store {store} serves {links} client link(s)"));
        }
        let replicas = self
            .volumes
            .iter()
            .filter(|v| v.replicas.iter().any(|r| r == store))
            .count();
        if replicas > 0 {
            return Some(format!("store {store} holds replicas of {replicas} volume(s)"));
        }
        None
    }
}

/// Cluster-wide mutations that need checks across tenants, stores and conductors.
pub struct ClusterController {
    client: Arc<ConductorClient>,
    topology: Arc<TopologyStore>,
    ledger: Arc<QuotaLedger>,
    cache_ttl: Duration,
    occupancy: RwLock<Option<OccupancySnapshot>>,
}

impl ClusterController {
    /// Creates a controller sharing `topology` and `ledger` caches; `cache_ttl` bounds trust in
    /// the occupancy snapshot.
    pub fn new(
        client: Arc<ConductorClient>,
        topology: Arc<TopologyStore>,
        ledger: Arc<QuotaLedger>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            client,
            topology,
            ledger,
            cache_ttl,
            occupancy: RwLock::new(None),
        }
    }

    /// Deletes a tenant that owns no volumes.
    pub async fn delete_tenant(&self, ctx: &ExecutionContext, name: &str) -> Result<()> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("tenant", name)?;

        let volumes = self.ledger.list_volumes(ctx, Some(name)).await?;
        if !volumes.is_empty() {
            return Err(MgmtError::PreconditionFailed(format!(
                "tenant {name} still owns {} volume(s)",
                volumes.len()
            )));
        }

        let request = Request::DeleteTenant {
            name: name.to_string(),
        };
        match ctx.call(&self.client, request).await {
            Ok(_) => {}
            Err(e) if ambiguous_rejection(&e, ErrorKind::NotFound) => {
                debug!(tenant = %name, "re-delivered delete_tenant already applied");
            }
            Err(e) => return Err(e.into()),
        }
        self.ledger.forget_tenant(name);
        info!(tenant = %name, "tenant deleted");
        Ok(())
    }

    /// Registers a store.
    pub async fn add_store(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        address_a: &str,
        address_b: &str,
    ) -> Result<()> {
        self.topology.add_store(ctx, name, address_a, address_b).await
    }

    /// Removes a store that serves no client and holds no replica.
    ///
    /// A snapshot younger than the cache TTL may clear the removal; a violation is always
    /// confirmed against fresh links and volumes.
    pub async fn delete_store(&self, ctx: &ExecutionContext, name: &str) -> Result<()> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("store", name)?;

        let cached = self
            .occupancy_snapshot()
            .filter(|s| s.age() < self.cache_ttl);
        let cleared = match cached {
            Some(snapshot) => snapshot.blocks_removal_of(name).is_none(),
            None => false,
        };
        if !cleared {
            let snapshot = self.refresh_occupancy(ctx).await?;
            if let Some(reason) = snapshot.blocks_removal_of(name) {
                return Err(MgmtError::PreconditionFailed(reason));
            }
        }

        self.topology.remove_store(ctx, name).await
    }

    /// Fetches client links and volume placement.
    pub async fn refresh_occupancy(&self, ctx: &ExecutionContext) -> Result<OccupancySnapshot> {
        ctx.authorize(Scope::Cluster)?;
        let links = match ctx
            .send(&self.client, Request::ListClientLinks(ClientLinkFilter::All))
            .await?
        {
            Response::ClientLinks(links) => materialize("client link", links)?,
            other => return Err(unexpected("list_client_links", other)),
        };
        let volumes = self.ledger.list_volumes(ctx, None).await?;
        let snapshot = OccupancySnapshot {
            links,
            volumes,
            taken_at: Instant::now(),
        };
        *self.occupancy.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Last occupancy snapshot, if one was taken.
    pub fn occupancy_snapshot(&self) -> Option<OccupancySnapshot> {
        self.occupancy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Commands a conductor role transition.
    pub async fn set_conductor_role(
        &self,
        ctx: &ExecutionContext,
        ip: &str,
        role: ConductorRole,
    ) -> Result<()> {
        self.topology.set_conductor_role(ctx, ip, role).await
    }

    /// Creates an admin identity.
    pub async fn create_admin(&self, ctx: &ExecutionContext, name: &str, password: &str) -> Result<()> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("admin", name)?;
        validate::password("admin", password)?;

        let request = Request::CreateAdmin {
            name: name.to_string(),
            password: password.to_string(),
        };
        match ctx.call(&self.client, request).await {
            Ok(_) => {}
            Err(e) if ambiguous_rejection(&e, ErrorKind::AlreadyExists) => {
                if !self.admin_login_works(ctx, name, password).await {
                    return Err(e.into());
                }
                debug!(admin = %name, "re-delivered create_admin already applied");
            }
            Err(e) => return Err(e.into()),
        }
        info!(admin = %name, "admin created");
        Ok(())
    }

    /// Deletes an admin identity.
    pub async fn delete_admin(&self, ctx: &ExecutionContext, name: &str) -> Result<()> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("admin", name)?;
        let request = Request::DeleteAdmin {
            name: name.to_string(),
        };
        match ctx.call(&self.client, request).await {
            Ok(_) => {}
            Err(e) if ambiguous_rejection(&e, ErrorKind::NotFound) => {
                debug!(admin = %name, "re-delivered delete_admin already applied");
            }
            Err(e) => return Err(e.into()),
        }
        info!(admin = %name, "admin deleted");
        Ok(())
    }

    /// Powers off a store. Success means the command was accepted.
    pub async fn power_off(&self, ctx: &ExecutionContext, store: &str) -> Result<()> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("store", store)?;
        let request = Request::PowerOff {
            store: store.to_string(),
        };
        match ctx.send(&self.client, request).await? {
            Response::Done => {
                self.topology.invalidate_stores();
                info!(store = %store, "power off accepted");
                Ok(())
            }
            other => Err(unexpected("power_off", other)),
        }
    }

    /// Sets the fan speed rate of a store; returns the speed reported back.
    ///
    /// `rate` is a percentage times 100.
    pub async fn set_fan_speed(&self, ctx: &ExecutionContext, store: &str, rate: u32) -> Result<i32> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("store", store)?;
        validate::fan_rate(rate)?;
        let request = Request::SetFanSpeed {
            store: store.to_string(),
            rate,
        };
        match ctx.send(&self.client, request).await? {
            Response::FanSpeed(speed) => {
                info!(store = %store, rate, speed, "fan speed set");
                Ok(speed)
            }
            other => Err(unexpected("set_fan_speed", other)),
        }
    }

    /// Aggregate capacity of every store.
    pub async fn cluster_capacity(&self, ctx: &ExecutionContext) -> Result<ClusterCapacity> {
        ctx.authorize(Scope::Cluster)?;
        match ctx.send(&self.client, Request::StatCluster).await? {
            Response::Capacity(capacity) => Ok(capacity),
            other => Err(unexpected("stat_cluster", other)),
        }
    }

    async fn admin_login_works(&self, ctx: &ExecutionContext, name: &str, password: &str) -> bool {
        let result = self
            .client
            .call(
                ctx.conductors(),
                &Executor::new(name, password),
                Request::Login,
                ctx.timeout(),
            )
            .await;
        matches!(
            result,
            Ok(outcome) if outcome.response == Response::LoggedIn(ExecutorRole::Admin)
        )
    }
}
