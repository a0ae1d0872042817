//! Topology store: s5store registry and conductor roles.
//!
//! The conductors own the topology. This store forwards mutations and keeps two client-side
//! views: the last store listing with the time it was fetched, and the last observed role of
//! every conductor. Both are written only after a conductor confirmed the result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use s5_conductor::{
    conductor_ip, ConductorInfo, ConductorRole, ConductorClient, ErrorKind, Request, Response,
    StoreDetail, StoreRecord,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::{ambiguous_rejection, unexpected, ExecutionContext, Scope};
use crate::error::{MgmtError, Result};
use crate::listing::materialize;
use crate::validate;

/// Last store listing and when it was fetched.
#[derive(Debug, Clone)]
pub struct CachedStores {
    /// Stores as listed by a conductor.
    pub stores: Vec<StoreRecord>,
    /// When the listing arrived.
    pub fetched_at: Instant,
}

impl CachedStores {
    /// Time since the listing arrived.
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// Store registry and conductor roles, with the cached views described above.
pub struct TopologyStore {
    client: Arc<ConductorClient>,
    stores: RwLock<Option<CachedStores>>,
    /// Bumped by every invalidation; a listing started under an older value is not cached.
    stores_generation: AtomicU64,
    roles: DashMap<String, ConductorRole>,
    role_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TopologyStore {
    /// Creates a store with empty caches.
    pub fn new(client: Arc<ConductorClient>) -> Self {
        Self {
            client,
            stores: RwLock::new(None),
            stores_generation: AtomicU64::new(0),
            roles: DashMap::new(),
            role_locks: DashMap::new(),
        }
    }

    /// Registers a store with its two daemon addresses.
    pub async fn add_store(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        address_a: &str,
        address_b: &str,
    ) -> Result<()> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("store", name)?;
        let a = validate::ipv4("daemon address", address_a)?;
        let b = validate::ipv4("daemon address", address_b)?;
        if a == b {
            return Err(MgmtError::InvalidArgument(format!(
                "store {name} daemon addresses must differ, both are {a}"
            )));
        }

        let request = Request::AddStore {
            name: name.to_string(),
            address_a: a.to_string(),
            address_b: b.to_string(),
        };
        match ctx.call(&self.client, request).await {
            Ok(_) => {}
            Err(e) if ambiguous_rejection(&e, ErrorKind::AlreadyExists) => {
                let detail = self.stat_store(ctx, name).await?;
                let same = detail.store.address_a == a.to_string()
                    && detail.store.address_b == b.to_string();
                if !same {
                    return Err(e.into());
                }
                debug!(store = %name, "re-delivered add_store already applied");
            }
            Err(e) => return Err(e.into()),
        }
        self.invalidate_stores();
        info!(store = %name, address_a = %a, address_b = %b, "store added");
        Ok(())
    }

    /// Unregisters a store.
    pub async fn remove_store(&self, ctx: &ExecutionContext, name: &str) -> Result<()> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("store", name)?;

        let request = Request::DeleteStore {
            name: name.to_string(),
        };
        match ctx.call(&self.client, request).await {
            Ok(_) => {}
            Err(e) if ambiguous_rejection(&e, ErrorKind::NotFound) => {
                debug!(store = %name, "re-delivered delete_store already applied");
            }
            Err(e) => return Err(e.into()),
        }
        self.invalidate_stores();
        info!(store = %name, "store removed");
        Ok(())
    }

    /// Fresh store listing from the conductors.
    pub async fn list_stores(&self, ctx: &ExecutionContext) -> Result<Vec<StoreRecord>> {
        ctx.authorize(Scope::Cluster)?;
        let generation = self.stores_generation.load(Ordering::Acquire);
        let stores = match ctx.send(&self.client, Request::ListStores).await? {
            Response::Stores(stores) => materialize("store", stores)?,
            other => return Err(unexpected("list_stores", other)),
        };
        let mut cache = self.stores.write().unwrap_or_else(|e| e.into_inner());
        if self.stores_generation.load(Ordering::Acquire) == generation {
            *cache = Some(CachedStores {
                stores: stores.clone(),
                fetched_at: Instant::now(),
            });
        } else {
            debug!("store listing overtaken by a mutation, not cached");
        }
        Ok(stores)
    }

    /// Last store listing, if any, with its fetch time.
    pub fn cached_stores(&self) -> Option<CachedStores> {
        self.stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn invalidate_stores(&self) {
        let mut cache = self.stores.write().unwrap_or_else(|e| e.into_inner());
        self.stores_generation.fetch_add(1, Ordering::AcqRel);
        *cache = None;
    }

    /// Store record with all hardware snapshots.
    pub async fn stat_store(&self, ctx: &ExecutionContext, name: &str) -> Result<StoreDetail> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("store", name)?;
        let request = Request::StatStore {
            name: name.to_string(),
        };
        match ctx.send(&self.client, request).await? {
            Response::StoreDetail(detail) => Ok(*detail),
            other => Err(unexpected("stat_store", other)),
        }
    }

    /// Role of one conductor as reported by the cluster.
    pub async fn stat_conductor(&self, ctx: &ExecutionContext, ip: &str) -> Result<ConductorInfo> {
        ctx.authorize(Scope::Cluster)?;
        let ip = validate::ipv4("conductor ip", ip)?.to_string();
        let request = Request::StatConductor { ip: ip.clone() };
        match ctx.send(&self.client, request).await? {
            Response::Conductor(info) => {
                self.roles.insert(info.ip.clone(), info.role);
                Ok(info)
            }
            other => Err(unexpected("stat_conductor", other)),
        }
    }

    /// Roles of every conductor of the context, each asked directly.
    ///
    /// A conductor that cannot be reached is reported as `Unknown`.
    pub async fn list_conductors(&self, ctx: &ExecutionContext) -> Result<Vec<ConductorInfo>> {
        ctx.authorize(Scope::Cluster)?;
        let mut out = Vec::new();
        out.try_reserve_exact(ctx.conductors().len())
            .map_err(|e| MgmtError::OutOfMemory(format!("conductor listing: {e}")))?;

        for addr in ctx.conductors() {
            let ip = conductor_ip(addr).to_string();
            let request = Request::StatConductor { ip: ip.clone() };
            let result = self
                .client
                .call(
                    std::slice::from_ref(addr),
                    ctx.executor(),
                    request,
                    ctx.timeout(),
                )
                .await;
            let info = match result {
                Ok(outcome) => match outcome.response {
                    Response::Conductor(info) => {
                        self.roles.insert(info.ip.clone(), info.role);
                        info
                    }
                    other => return Err(unexpected("stat_conductor", other)),
                },
                Err(e) if matches!(e.kind(), ErrorKind::Unreachable | ErrorKind::DeadlineExceeded) => {
                    warn!(conductor = %addr, error = %e, "conductor not answering");
                    ConductorInfo {
                        ip,
                        role: ConductorRole::Unknown,
                    }
                }
                Err(e) => return Err(e.into()),
            };
            out.push(info);
        }
        Ok(out)
    }

    /// Commands a role transition.
    ///
    /// Transitions of the same conductor are serialized. A transition to `Leader` fails with
    /// `Conflict` while another conductor is observed as leader; the cluster demotes any
    /// other leader when it accepts the transition.
    pub async fn set_conductor_role(
        &self,
        ctx: &ExecutionContext,
        ip: &str,
        role: ConductorRole,
    ) -> Result<()> {
        ctx.authorize(Scope::Cluster)?;
        let ip = validate::ipv4("conductor ip", ip)?.to_string();
        if role == ConductorRole::Unknown {
            return Err(MgmtError::InvalidArgument(format!(
                "conductor {ip} cannot be set to role unknown"
            )));
        }

        let lock = self.role_lock(&ip);
        let _guard = lock.lock().await;

        if role == ConductorRole::Leader {
            if let Some(leader) = self.observed_leader_other_than(&ip) {
                warn!(conductor = %ip, leader = %leader, "leader transition rejected");
                return Err(MgmtError::Conflict(format!(
                    "conductor {leader} is observed as leader"
                )));
            }
        }

        let request = Request::SetConductorRole {
            ip: ip.clone(),
            role,
        };
        ctx.send(&self.client, request).await?;

        if role == ConductorRole::Leader {
            for mut entry in self.roles.iter_mut() {
                if entry.key() != &ip && *entry.value() == ConductorRole::Leader {
                    *entry.value_mut() = ConductorRole::Follower;
                }
            }
        }
        self.roles.insert(ip.clone(), role);
        info!(conductor = %ip, role = %role, "conductor role set");
        Ok(())
    }

    /// Last observed role of a conductor.
    pub fn cached_role(&self, ip: &str) -> Option<ConductorRole> {
        self.roles.get(ip).map(|r| *r)
    }

    fn role_lock(&self, ip: &str) -> Arc<Mutex<()>> {
        self.role_locks
            .entry(ip.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn observed_leader_other_than(&self, ip: &str) -> Option<String> {
        self.roles
            .iter()
            .find(|e| e.key() != ip && *e.value() == ConductorRole::Leader)
            .map(|e| e.key().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use s5_conductor::{ConductorConnection, ConductorTransport, Envelope, Reply, SimCluster};

    fn setup() -> (SimCluster, TopologyStore, ExecutionContext) {
        let cluster = SimCluster::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let topology = TopologyStore::new(testutil::client(&cluster));
        let ctx = testutil::admin(&cluster);
        (cluster, topology, ctx)
    }

    #[tokio::test]
    async fn test_add_and_list_store() {
        let (_cluster, topology, ctx) = setup();
        topology
            .add_store(&ctx, "store1", "10.1.0.1", "10.1.0.2")
            .await
            .unwrap();
        let stores = topology.list_stores(&ctx).await.unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].address_b, "10.1.0.2");
        let cached = topology.cached_stores().unwrap();
        assert_eq!(cached.stores, stores);
        assert!(cached.age() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_add_store_validates_before_sending() {
        let (cluster, topology, ctx) = setup();
        for (name, a, b) in [
            ("store 1", "10.1.0.1", "10.1.0.2"),
            ("store1", "10.1.0", "10.1.0.2"),
            ("store1", "10.1.0.1", "10.1.0.1"),
        ] {
            let err = topology.add_store(&ctx, name, a, b).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert_eq!(cluster.mutations_received(), 0);
    }

    #[tokio::test]
    async fn test_add_duplicate_store() {
        let (_cluster, topology, ctx) = setup();
        topology
            .add_store(&ctx, "store1", "10.1.0.1", "10.1.0.2")
            .await
            .unwrap();
        let err = topology
            .add_store(&ctx, "store1", "10.1.0.3", "10.1.0.4")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    /// Holds `ListStores` replies until `release` is notified.
    struct HeldListings {
        inner: s5_conductor::SimTransport,
        sent: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    struct HeldConnection {
        inner: Box<dyn ConductorConnection>,
        sent: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
        holding: bool,
    }

    #[async_trait::async_trait]
    impl ConductorTransport for HeldListings {
        async fn connect(
            &self,
            addr: &str,
        ) -> s5_conductor::Result<Box<dyn ConductorConnection>> {
            Ok(Box::new(HeldConnection {
                inner: self.inner.connect(addr).await?,
                sent: self.sent.clone(),
                release: self.release.clone(),
                holding: false,
            }))
        }
    }

    #[async_trait::async_trait]
    impl ConductorConnection for HeldConnection {
        async fn send(&mut self, envelope: &Envelope) -> s5_conductor::Result<()> {
            self.holding = envelope.request == Request::ListStores;
            self.inner.send(envelope).await
        }

        async fn recv(&mut self) -> s5_conductor::Result<Reply> {
            let reply = self.inner.recv().await?;
            if self.holding {
                self.sent.notify_one();
                self.release.notified().await;
            }
            Ok(reply)
        }

        fn peer_addr(&self) -> &str {
            self.inner.peer_addr()
        }
    }

    #[tokio::test]
    async fn test_listing_overtaken_by_mutation_is_not_cached() {
        use s5_conductor::ConductorClientConfig;

        let cluster = SimCluster::new(&["10.0.0.1"]);
        let sent = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let transport = HeldListings {
            inner: cluster.transport(),
            sent: sent.clone(),
            release: release.clone(),
        };
        let client = Arc::new(ConductorClient::new(
            Arc::new(transport),
            ConductorClientConfig::default(),
        ));
        let topology = Arc::new(TopologyStore::new(client));
        let ctx = testutil::admin(&cluster);

        let listing = tokio::spawn({
            let topology = topology.clone();
            let ctx = ctx.clone();
            async move { topology.list_stores(&ctx).await }
        });
        // The conductor has answered the listing; the reply is still on its way.
        sent.notified().await;
        topology
            .add_store(&ctx, "store1", "10.1.0.1", "10.1.0.2")
            .await
            .unwrap();
        release.notify_one();

        let stale = listing.await.unwrap().unwrap();
        assert!(stale.is_empty());
        assert!(topology.cached_stores().is_none());

        let fresh = topology.list_stores(&ctx).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(topology.cached_stores().unwrap().stores, fresh);
    }

    #[tokio::test]
    async fn test_mutation_invalidates_listing() {
        let (_cluster, topology, ctx) = setup();
        topology.list_stores(&ctx).await.unwrap();
        assert!(topology.cached_stores().is_some());
        topology
            .add_store(&ctx, "store1", "10.1.0.1", "10.1.0.2")
            .await
            .unwrap();
        assert!(topology.cached_stores().is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown_store() {
        let (_cluster, topology, ctx) = setup();
        let err = topology.remove_store(&ctx, "ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_tenant_cannot_touch_topology() {
        let (cluster, topology, _) = setup();
        let ctx = testutil::tenant(&cluster, "acme", "pw");
        let err = topology.remove_store(&ctx, "store1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        let err = topology.list_stores(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_stat_conductor_caches_role() {
        let (_cluster, topology, ctx) = setup();
        assert_eq!(topology.cached_role("10.0.0.1"), None);
        let info = topology.stat_conductor(&ctx, "10.0.0.1").await.unwrap();
        assert_eq!(info.role, ConductorRole::Leader);
        assert_eq!(topology.cached_role("10.0.0.1"), Some(ConductorRole::Leader));
    }

    #[tokio::test]
    async fn test_list_conductors_reports_unreachable_as_unknown() {
        let (cluster, topology, ctx) = setup();
        cluster.stop("10.0.0.2");
        let infos = topology.list_conductors(&ctx).await.unwrap();
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].role, ConductorRole::Leader);
        assert_eq!(infos[1].role, ConductorRole::Unknown);
        assert_eq!(infos[2].role, ConductorRole::Follower);
    }

    #[tokio::test]
    async fn test_leader_transition_conflicts_with_observed_leader() {
        let (cluster, topology, ctx) = setup();
        topology.stat_conductor(&ctx, "10.0.0.1").await.unwrap();
        let err = topology
            .set_conductor_role(&ctx, "10.0.0.2", ConductorRole::Leader)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(cluster.role("10.0.0.2"), Some(ConductorRole::Follower));
    }

    #[tokio::test]
    async fn test_handover_after_demotion() {
        let (cluster, topology, ctx) = setup();
        topology.stat_conductor(&ctx, "10.0.0.1").await.unwrap();
        topology
            .set_conductor_role(&ctx, "10.0.0.1", ConductorRole::Follower)
            .await
            .unwrap();
        topology
            .set_conductor_role(&ctx, "10.0.0.2", ConductorRole::Leader)
            .await
            .unwrap();
        assert_eq!(cluster.leaders(), vec!["10.0.0.2".to_string()]);
        assert_eq!(topology.cached_role("10.0.0.2"), Some(ConductorRole::Leader));
        assert_eq!(topology.cached_role("10.0.0.1"), Some(ConductorRole::Follower));
    }

    #[tokio::test]
    async fn test_unknown_role_rejected() {
        let (_cluster, topology, ctx) = setup();
        let err = topology
            .set_conductor_role(&ctx, "10.0.0.1", ConductorRole::Unknown)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_role_transitions_serialize_per_conductor() {
        let (cluster, topology, ctx) = setup();
        let topology = Arc::new(topology);
        let mut tasks = Vec::new();
        for ip in ["10.0.0.2", "10.0.0.3", "10.0.0.2", "10.0.0.3"] {
            let topology = topology.clone();
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                topology
                    .set_conductor_role(&ctx, ip, ConductorRole::Leader)
                    .await
            }));
        }
        for task in tasks {
            let _ = task.await.unwrap();
        }
        assert_eq!(cluster.leaders().len(), 1);
    }
}
