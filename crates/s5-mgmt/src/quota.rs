//! Quota ledger: tenant quotas, volume metadata and usage accounting.
//!
//! Limits are booked on the conductors and reported back; nothing here admits or refuses
//! I/O. Tenant records are cached after every confirmed read or write.

use std::sync::Arc;

use dashmap::DashMap;
use s5_conductor::{
    ConductorClient, ErrorKind, Quota, RealtimeStats, Request, Response, StatsScope,
    TenantRecord, VolumeRecord,
};
use tracing::{debug, info};

use crate::context::{ambiguous_rejection, unexpected, ExecutionContext, Scope};
use crate::error::{MgmtError, Result};
use crate::listing::materialize;
use crate::validate;

/// Value of an update field that leaves it unchanged. Any negative value does.
pub const UNCHANGED: i64 = -1;

/// Fields to change on a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantUpdate {
    /// Rename to this name.
    pub new_name: Option<String>,
    /// Replace the password.
    pub new_password: Option<String>,
    /// Capacity in bytes; negative leaves it unchanged.
    pub size: i64,
    /// IOPS limit; negative leaves it unchanged.
    pub iops: i64,
    /// Bandwidth limit in bytes per second; negative leaves it unchanged.
    pub bw: i64,
}

impl Default for TenantUpdate {
    fn default() -> Self {
        Self {
            new_name: None,
            new_password: None,
            size: UNCHANGED,
            iops: UNCHANGED,
            bw: UNCHANGED,
        }
    }
}

/// Parameters of a new volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Capacity in bytes.
    pub size: u64,
    /// IOPS limit.
    pub iops: u64,
    /// Bandwidth limit in bytes per second.
    pub bandwidth: u64,
    /// Stores to place replicas on; empty lets the cluster choose.
    pub replicas: Vec<String>,
}

/// Tenant quotas and volume metadata, with a cache of confirmed tenant records.
pub struct QuotaLedger {
    client: Arc<ConductorClient>,
    tenants: DashMap<String, TenantRecord>,
}

impl QuotaLedger {
    /// Creates a ledger with an empty tenant cache.
    pub fn new(client: Arc<ConductorClient>) -> Self {
        Self {
            client,
            tenants: DashMap::new(),
        }
    }

    /// Creates a tenant with its initial quota.
    pub async fn create_tenant(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        password: &str,
        quota: Quota,
    ) -> Result<TenantRecord> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("tenant", name)?;
        validate::password("tenant", password)?;

        let request = Request::CreateTenant {
            name: name.to_string(),
            password: password.to_string(),
            quota,
        };
        let record = match ctx.call(&self.client, request).await {
            Ok(_) => TenantRecord {
                name: name.to_string(),
                quota,
            },
            Err(e) if ambiguous_rejection(&e, ErrorKind::AlreadyExists) => {
                let existing = self.stat_tenant(ctx, name).await?;
                if existing.quota != quota {
                    return Err(e.into());
                }
                debug!(tenant = %name, "re-delivered create_tenant already applied");
                existing
            }
            Err(e) => return Err(e.into()),
        };
        self.tenants.insert(record.name.clone(), record.clone());
        info!(
            tenant = %name,
            capacity = quota.capacity,
            iops = quota.iops,
            bandwidth = quota.bandwidth,
            "tenant created"
        );
        Ok(record)
    }

    /// Applies `update`. An update that changes nothing sends no mutation.
    pub async fn update_tenant(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        update: TenantUpdate,
    ) -> Result<TenantRecord> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("tenant", name)?;
        let new_name = update.new_name.filter(|n| n != name);
        if let Some(new_name) = &new_name {
            validate::name("tenant", new_name)?;
        }
        if let Some(password) = &update.new_password {
            validate::password("tenant", password)?;
        }
        let capacity = validate::sentinel(update.size);
        let iops = validate::sentinel(update.iops);
        let bandwidth = validate::sentinel(update.bw);

        if new_name.is_none()
            && update.new_password.is_none()
            && capacity.is_none()
            && iops.is_none()
            && bandwidth.is_none()
        {
            debug!(tenant = %name, "tenant update changes nothing");
            return self.stat_tenant(ctx, name).await;
        }

        let request = Request::UpdateTenant {
            name: name.to_string(),
            new_name: new_name.clone(),
            new_password: update.new_password,
            capacity,
            iops,
            bandwidth,
        };
        let record = match ctx.call(&self.client, request).await {
            Ok(outcome) => match outcome.response {
                Response::Tenant(record) => record,
                other => return Err(unexpected("update_tenant", other)),
            },
            Err(e) if new_name.is_some() && ambiguous_rejection(&e, ErrorKind::NotFound) => {
                let target = new_name.as_deref().unwrap_or(name);
                debug!(tenant = %name, to = %target, "re-delivered rename already applied");
                self.stat_tenant(ctx, target).await?
            }
            Err(e) => return Err(e.into()),
        };
        if record.name != name {
            self.tenants.remove(name);
        }
        self.tenants.insert(record.name.clone(), record.clone());
        info!(tenant = %record.name, "tenant updated");
        Ok(record)
    }

    /// Reads one tenant.
    pub async fn stat_tenant(&self, ctx: &ExecutionContext, name: &str) -> Result<TenantRecord> {
        ctx.authorize(Scope::Tenant(name))?;
        validate::name("tenant", name)?;
        let request = Request::StatTenant {
            name: name.to_string(),
        };
        match ctx.send(&self.client, request).await? {
            Response::Tenant(record) => {
                self.tenants.insert(record.name.clone(), record.clone());
                Ok(record)
            }
            other => Err(unexpected("stat_tenant", other)),
        }
    }

    /// Lists every tenant.
    pub async fn list_tenants(&self, ctx: &ExecutionContext) -> Result<Vec<TenantRecord>> {
        ctx.authorize(Scope::Cluster)?;
        match ctx.send(&self.client, Request::ListTenants).await? {
            Response::Tenants(tenants) => {
                let tenants = materialize("tenant", tenants)?;
                for t in &tenants {
                    self.tenants.insert(t.name.clone(), t.clone());
                }
                Ok(tenants)
            }
            other => Err(unexpected("list_tenants", other)),
        }
    }

    /// Occupied bytes of one volume, or of every volume of the tenant.
    ///
    /// The tenant total is summed over a fresh volume listing on every call.
    pub async fn get_occupied_size(
        &self,
        ctx: &ExecutionContext,
        tenant: &str,
        volume: Option<&str>,
    ) -> Result<u64> {
        ctx.authorize(Scope::Tenant(tenant))?;
        validate::name("tenant", tenant)?;
        match volume {
            Some(volume) => {
                validate::name("volume", volume)?;
                let request = Request::OccupiedSize {
                    tenant: tenant.to_string(),
                    volume: Some(volume.to_string()),
                };
                match ctx.send(&self.client, request).await? {
                    Response::Size(size) => Ok(size),
                    other => Err(unexpected("occupied_size", other)),
                }
            }
            None => {
                let volumes = self.list_volumes(ctx, Some(tenant)).await?;
                Ok(volumes
                    .iter()
                    .fold(0u64, |sum, v| sum.saturating_add(v.occupied)))
            }
        }
    }

    /// Point-in-time I/O statistics of a store, tenant or volume.
    pub async fn get_realtime_statistics(
        &self,
        ctx: &ExecutionContext,
        scope: &StatsScope,
    ) -> Result<RealtimeStats> {
        match scope {
            StatsScope::Store(store) => {
                ctx.authorize(Scope::Cluster)?;
                validate::name("store", store)?;
            }
            StatsScope::Tenant(tenant) => {
                ctx.authorize(Scope::Tenant(tenant))?;
                validate::name("tenant", tenant)?;
            }
            StatsScope::Volume { tenant, volume } => {
                ctx.authorize(Scope::Tenant(tenant))?;
                validate::name("tenant", tenant)?;
                validate::name("volume", volume)?;
            }
        }
        match ctx
            .send(&self.client, Request::RealtimeStatistics(scope.clone()))
            .await?
        {
            Response::Statistics(stats) => Ok(stats),
            other => Err(unexpected("realtime_statistics", other)),
        }
    }

    /// Creates volume metadata for `tenant`.
    pub async fn create_volume(
        &self,
        ctx: &ExecutionContext,
        tenant: &str,
        name: &str,
        spec: VolumeSpec,
    ) -> Result<VolumeRecord> {
        ctx.authorize(Scope::Tenant(tenant))?;
        validate::name("tenant", tenant)?;
        validate::name("volume", name)?;
        if spec.size == 0 {
            return Err(MgmtError::InvalidArgument(format!(
                "volume {tenant}/{name} size must be positive"
            )));
        }
        if spec.replicas.len() > validate::MAX_REPLICAS {
            return Err(MgmtError::InvalidArgument(format!(
                "volume {tenant}/{name} requests {} replicas, at most {} allowed",
                spec.replicas.len(),
                validate::MAX_REPLICAS
            )));
        }
        for store in &spec.replicas {
            validate::name("store", store)?;
        }

        let size = spec.size;
        let request = Request::CreateVolume {
            tenant: tenant.to_string(),
            name: name.to_string(),
            size: spec.size,
            iops: spec.iops,
            bandwidth: spec.bandwidth,
            replicas: spec.replicas,
        };
        let record = match ctx.call(&self.client, request).await {
            Ok(outcome) => match outcome.response {
                Response::Volume(record) => record,
                other => return Err(unexpected("create_volume", other)),
            },
            Err(e) if ambiguous_rejection(&e, ErrorKind::AlreadyExists) => {
                let existing = self.stat_volume(ctx, tenant, name).await?;
                if existing.size != size {
                    return Err(e.into());
                }
                debug!(tenant = %tenant, volume = %name, "re-delivered create_volume already applied");
                existing
            }
            Err(e) => return Err(e.into()),
        };
        info!(tenant = %tenant, volume = %name, size, "volume created");
        Ok(record)
    }

    /// Deletes volume metadata.
    pub async fn delete_volume(&self, ctx: &ExecutionContext, tenant: &str, name: &str) -> Result<()> {
        ctx.authorize(Scope::Tenant(tenant))?;
        validate::name("tenant", tenant)?;
        validate::name("volume", name)?;
        let request = Request::DeleteVolume {
            tenant: tenant.to_string(),
            name: name.to_string(),
        };
        match ctx.call(&self.client, request).await {
            Ok(_) => {}
            Err(e) if ambiguous_rejection(&e, ErrorKind::NotFound) => {
                debug!(tenant = %tenant, volume = %name, "re-delivered delete_volume already applied");
            }
            Err(e) => return Err(e.into()),
        }
        info!(tenant = %tenant, volume = %name, "volume deleted");
        Ok(())
    }

    /// Reads one volume.
    pub async fn stat_volume(
        &self,
        ctx: &ExecutionContext,
        tenant: &str,
        name: &str,
    ) -> Result<VolumeRecord> {
        ctx.authorize(Scope::Tenant(tenant))?;
        validate::name("tenant", tenant)?;
        validate::name("volume", name)?;
        let request = Request::StatVolume {
            tenant: tenant.to_string(),
            name: name.to_string(),
        };
        match ctx.send(&self.client, request).await? {
            Response::Volume(record) => Ok(record),
            other => Err(unexpected("stat_volume", other)),
        }
    }

    /// Changes the provisioned size of a volume.
    pub async fn resize_volume(
        &self,
        ctx: &ExecutionContext,
        tenant: &str,
        name: &str,
        size: u64,
    ) -> Result<VolumeRecord> {
        ctx.authorize(Scope::Tenant(tenant))?;
        validate::name("tenant", tenant)?;
        validate::name("volume", name)?;
        if size == 0 {
            return Err(MgmtError::InvalidArgument(format!(
                "volume {tenant}/{name} size must be positive"
            )));
        }
        let request = Request::ResizeVolume {
            tenant: tenant.to_string(),
            name: name.to_string(),
            size,
        };
        match ctx.send(&self.client, request).await? {
            Response::Volume(record) => {
                info!(tenant = %tenant, volume = %name, size, "volume resized");
                Ok(record)
            }
            other => Err(unexpected("resize_volume", other)),
        }
    }

    /// Volumes of one tenant, or of the whole cluster.
    pub async fn list_volumes(
        &self,
        ctx: &ExecutionContext,
        tenant: Option<&str>,
    ) -> Result<Vec<VolumeRecord>> {
        match tenant {
            Some(tenant) => {
                ctx.authorize(Scope::Tenant(tenant))?;
                validate::name("tenant", tenant)?;
            }
            None => ctx.authorize(Scope::Cluster)?,
        }
        let request = Request::ListVolumes {
            tenant: tenant.map(str::to_string),
        };
        match ctx.send(&self.client, request).await? {
            Response::Volumes(volumes) => materialize("volume", volumes),
            other => Err(unexpected("list_volumes", other)),
        }
    }

    /// Provisioned size of a volume.
    pub async fn volume_size(&self, ctx: &ExecutionContext, tenant: &str, name: &str) -> Result<u64> {
        Ok(self.stat_volume(ctx, tenant, name).await?.size)
    }

    /// Last confirmed record of a tenant.
    pub fn cached_tenant(&self, name: &str) -> Option<TenantRecord> {
        self.tenants.get(name).map(|t| t.clone())
    }

    pub(crate) fn forget_tenant(&self, name: &str) {
        self.tenants.remove(name);
    }
}
