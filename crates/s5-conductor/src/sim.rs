//! In-memory conductor cluster.
//!
//! `SimCluster` holds the authoritative control-plane state shared by every simulated
//! conductor: admins, tenants, volumes, stores, client links, statistics and conductor
//! roles. It answers the full [`Request`] set, enforces credentials and scopes, treats
//! repeated mutations idempotently and arbitrates leadership. Conductors can be stopped
//! and restarted, and replies can be dropped after a request was applied.
//!
//! The data-path side (client attach/detach, written bytes, I/O statistics) is fed in
//! through [`SimCluster::attach_link`], [`SimCluster::record_write`] and
//! [`SimCluster::record_statistics`]; hardware snapshots come from a [`SensorProbe`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::message::{
    conductor_ip, deserialize_message, serialize_message, BccInfo, ClientLinkRecord,
    ClusterCapacity, ComponentStatus, ConductorInfo, ConductorRole, Envelope, ErrorKind,
    Executor, ExecutorRole, FanInfo, HostPortInfo, PowerInfo, Quota, RealtimeStats,
    RemoteError, Reply, Request, Response, RgeInfo, StatsScope, StoreDetail, StoreRecord,
    StoreStatus, TenantRecord, TraySetInfo, TrayInfo, VolumeRecord,
};
use crate::server::ConductorService;
use crate::transport::{ConductorConnection, ConductorTransport};

/// Admin identity every simulated cluster starts with.
pub const DEFAULT_ADMIN: &str = "admin";
/// Credential of [`DEFAULT_ADMIN`].
pub const DEFAULT_ADMIN_PASSWORD: &str = "s5admin";
/// Raw capacity of a newly added store, in bytes.
pub const DEFAULT_STORE_CAPACITY: u64 = 4 * 1024 * 1024 * 1024 * 1024;
/// Fan speed at a rate of 10000.
pub const FAN_MAX_RPM: i32 = 12_000;
/// Highest accepted fan speed rate (percentage times 100).
pub const MAX_FAN_RATE: u32 = 10_000;

const DEFAULT_FAN_RATE: i32 = 5_000;
const DEFAULT_REPLICAS: usize = 2;

// ============================================================================
// Sensors
// ============================================================================

/// Source of hardware snapshots for a store.
pub trait SensorProbe: Send + Sync {
    /// Fans of `store`.
    fn fans(&self, store: &str) -> Vec<FanInfo>;
    /// Power supplies of `store`.
    fn powers(&self, store: &str) -> Vec<PowerInfo>;
    /// Tray modules of `store`.
    fn trays(&self, store: &str) -> Vec<TrayInfo>;
    /// BCC modules of `store`.
    fn bccs(&self, store: &str) -> Vec<BccInfo>;
    /// RGE modules of `store`.
    fn rges(&self, store: &str) -> Vec<RgeInfo>;
    /// Host ports of `store`.
    fn host_ports(&self, store: &str) -> Vec<HostPortInfo>;
}

/// Sensor probe reporting a fixed, healthy hardware inventory.
#[derive(Debug, Clone)]
pub struct StaticSensors {
    /// Fans per store.
    pub fans: usize,
    /// Power supplies per store.
    pub powers: usize,
    /// Trays per store.
    pub trays: usize,
    /// Disk sets per tray.
    pub sets_per_tray: usize,
    /// BCC modules per store.
    pub bccs: usize,
    /// RGE modules per store.
    pub rges: usize,
    /// Host ports per store.
    pub host_ports: usize,
}

impl Default for StaticSensors {
    fn default() -> Self {
        Self {
            fans: 4,
            powers: 2,
            trays: 2,
            sets_per_tray: 4,
            bccs: 1,
            rges: 2,
            host_ports: 2,
        }
    }
}

impl SensorProbe for StaticSensors {
    fn fans(&self, _store: &str) -> Vec<FanInfo> {
        (0..self.fans)
            .map(|i| FanInfo {
                name: format!("fan{i}"),
                status: ComponentStatus::Ok,
                speed: FAN_MAX_RPM * DEFAULT_FAN_RATE / MAX_FAN_RATE as i32,
                rate: DEFAULT_FAN_RATE,
            })
            .collect()
    }

    fn powers(&self, _store: &str) -> Vec<PowerInfo> {
        (0..self.powers)
            .map(|i| PowerInfo {
                name: format!("power{i}"),
                status: ComponentStatus::Ok,
                input_ok: true,
                output_ok: true,
                fan_ok: true,
                temperatures: vec![34.5, 36.0],
                output_current: 20.5,
                input_current: 2.1,
                output_voltage: 12.0,
                input_voltage: 230.0,
                watts: 246.0,
            })
            .collect()
    }

    fn trays(&self, _store: &str) -> Vec<TrayInfo> {
        (0..self.trays)
            .map(|i| TrayInfo {
                name: format!("tray{i}"),
                status: ComponentStatus::Ok,
                model: "S5T-24".to_string(),
                bit: 64,
                firmware: 0x0102_0003,
                temperature: 41.0,
                raw_capacity_mb: 2 * 1024 * 1024,
                usable_capacity_mb: 1_900_000,
                sets: (0..self.sets_per_tray)
                    .map(|s| TraySetInfo {
                        name: format!("tray{i}-set{s}"),
                        status: ComponentStatus::Ok,
                        model: "NVMe-512".to_string(),
                        bit: 64,
                        temperature: 39.5,
                    })
                    .collect(),
            })
            .collect()
    }

    fn bccs(&self, _store: &str) -> Vec<BccInfo> {
        (0..self.bccs)
            .map(|i| BccInfo {
                name: format!("bcc{i}"),
                status: ComponentStatus::Ok,
                model: "BCC-2".to_string(),
                temperature: 45.0,
            })
            .collect()
    }

    fn rges(&self, _store: &str) -> Vec<RgeInfo> {
        (0..self.rges)
            .map(|i| RgeInfo {
                name: format!("rge{i}"),
                status: ComponentStatus::Ok,
                model: "RGE-10G".to_string(),
                bit: 64,
                temperature: 43.0,
            })
            .collect()
    }

    fn host_ports(&self, _store: &str) -> Vec<HostPortInfo> {
        (0..self.host_ports)
            .map(|i| HostPortInfo {
                name: format!("port{i}"),
                ip: format!("10.10.{i}.1"),
                mac: format!("02:00:00:00:00:{i:02x}"),
                mask: "255.255.255.0".to_string(),
                status: ComponentStatus::Ok,
            })
            .collect()
    }
}

// ============================================================================
// Cluster state
// ============================================================================

struct TenantEntry {
    password: String,
    quota: Quota,
}

struct StoreEntry {
    address_a: String,
    address_b: String,
    status: StoreStatus,
    capacity_total: u64,
    fan_rate: Option<i32>,
}

#[derive(Default)]
struct ClusterState {
    admins: BTreeMap<String, String>,
    tenants: BTreeMap<String, TenantEntry>,
    volumes: BTreeMap<(String, String), VolumeRecord>,
    stores: BTreeMap<String, StoreEntry>,
    roles: BTreeMap<String, ConductorRole>,
    links: Vec<ClientLinkRecord>,
    stats: HashMap<StatsScope, RealtimeStats>,
    mutations_received: u64,
}

#[derive(Debug, Clone, Copy)]
struct NodeState {
    online: bool,
    drop_replies: u32,
}

struct Inner {
    addrs: Vec<String>,
    state: Mutex<ClusterState>,
    nodes: Mutex<HashMap<String, NodeState>>,
    sensors: Arc<dyn SensorProbe>,
}

/// Shared in-memory conductor cluster.
#[derive(Clone)]
pub struct SimCluster {
    inner: Arc<Inner>,
}

type Outcome = std::result::Result<Response, RemoteError>;

fn err(kind: ErrorKind, detail: impl Into<String>) -> RemoteError {
    RemoteError::new(kind, detail)
}

impl SimCluster {
    /// Creates a cluster with the given conductor addresses and static sensors.
    ///
    /// The first conductor starts as leader, the others as followers.
    pub fn new(conductors: &[&str]) -> Self {
        Self::with_sensors(conductors, Arc::new(StaticSensors::default()))
    }

    /// Creates a cluster whose hardware snapshots come from `sensors`.
    pub fn with_sensors(conductors: &[&str], sensors: Arc<dyn SensorProbe>) -> Self {
        let mut state = ClusterState::default();
        state
            .admins
            .insert(DEFAULT_ADMIN.to_string(), DEFAULT_ADMIN_PASSWORD.to_string());
        let mut nodes = HashMap::new();
        for (i, addr) in conductors.iter().enumerate() {
            let role = if i == 0 {
                ConductorRole::Leader
            } else {
                ConductorRole::Follower
            };
            state.roles.insert(conductor_ip(addr).to_string(), role);
            nodes.insert(
                addr.to_string(),
                NodeState {
                    online: true,
                    drop_replies: 0,
                },
            );
        }
        Self {
            inner: Arc::new(Inner {
                addrs: conductors.iter().map(|a| a.to_string()).collect(),
                state: Mutex::new(state),
                nodes: Mutex::new(nodes),
                sensors,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<String, NodeState>> {
        self.inner.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Conductor addresses in configured order.
    pub fn addrs(&self) -> Vec<String> {
        self.inner.addrs.clone()
    }

    /// Transport connecting to the simulated conductors.
    pub fn transport(&self) -> SimTransport {
        SimTransport {
            cluster: self.clone(),
        }
    }

    /// Service answering as the conductor at `addr`, for serving over TCP.
    pub fn service(&self, addr: &str) -> SimConductor {
        SimConductor {
            cluster: self.clone(),
            addr: addr.to_string(),
        }
    }

    /// Takes the conductor at `addr` offline.
    pub fn stop(&self, addr: &str) {
        if let Some(node) = self.nodes().get_mut(addr) {
            node.online = false;
            info!(addr = addr, "simulated conductor stopped");
        }
    }

    /// Brings the conductor at `addr` back online.
    pub fn start(&self, addr: &str) {
        if let Some(node) = self.nodes().get_mut(addr) {
            node.online = true;
            info!(addr = addr, "simulated conductor started");
        }
    }

    /// Whether the conductor at `addr` exists and is online.
    pub fn is_online(&self, addr: &str) -> bool {
        self.nodes().get(addr).map(|n| n.online).unwrap_or(false)
    }

    /// Applies the next `count` requests at `addr` but never answers them.
    pub fn drop_replies(&self, addr: &str, count: u32) {
        if let Some(node) = self.nodes().get_mut(addr) {
            node.drop_replies = count;
        }
    }

    fn take_drop(&self, addr: &str) -> bool {
        match self.nodes().get_mut(addr) {
            Some(node) if node.drop_replies > 0 => {
                node.drop_replies -= 1;
                true
            }
            _ => false,
        }
    }

    /// Conductor IPs currently holding the leader role.
    pub fn leaders(&self) -> Vec<String> {
        self.state()
            .roles
            .iter()
            .filter(|(_, role)| **role == ConductorRole::Leader)
            .map(|(ip, _)| ip.clone())
            .collect()
    }

    /// Role recorded for the conductor with `ip`.
    pub fn role(&self, ip: &str) -> Option<ConductorRole> {
        self.state().roles.get(ip).copied()
    }

    /// Overrides a conductor role without arbitration, as a partition would.
    pub fn force_role(&self, ip: &str, role: ConductorRole) {
        self.state().roles.insert(ip.to_string(), role);
    }

    /// Number of mutating requests received by any conductor.
    pub fn mutations_received(&self) -> u64 {
        self.state().mutations_received
    }

    /// Registers an attached data-path client.
    pub fn attach_link(&self, link: ClientLinkRecord) -> std::result::Result<(), RemoteError> {
        let mut state = self.state();
        if !state
            .volumes
            .contains_key(&(link.tenant.clone(), link.volume.clone()))
        {
            return Err(err(
                ErrorKind::NotFound,
                format!("volume {}/{} not found", link.tenant, link.volume),
            ));
        }
        if !state.stores.contains_key(&link.store) {
            return Err(err(
                ErrorKind::NotFound,
                format!("store {} not found", link.store),
            ));
        }
        state
            .links
            .retain(|l| !(l.client_ip == link.client_ip && l.client_port == link.client_port));
        debug!(client = %link.client_ip, volume = %link.volume, "client attached");
        state.links.push(link);
        Ok(())
    }

    /// Removes the link of a detached client. Returns whether it existed.
    pub fn detach_link(&self, client_ip: &str, client_port: u16) -> bool {
        let mut state = self.state();
        let before = state.links.len();
        state
            .links
            .retain(|l| !(l.client_ip == client_ip && l.client_port == client_port));
        state.links.len() != before
    }

    /// Accounts `bytes` written to a volume; occupancy never exceeds the volume size.
    pub fn record_write(
        &self,
        tenant: &str,
        volume: &str,
        bytes: u64,
    ) -> std::result::Result<u64, RemoteError> {
        let mut state = self.state();
        let record = state
            .volumes
            .get_mut(&(tenant.to_string(), volume.to_string()))
            .ok_or_else(|| {
                err(
                    ErrorKind::NotFound,
                    format!("volume {tenant}/{volume} not found"),
                )
            })?;
        record.occupied = record.occupied.saturating_add(bytes).min(record.size);
        Ok(record.occupied)
    }

    /// Stores the latest statistics sample for `scope`.
    pub fn record_statistics(&self, scope: StatsScope, stats: RealtimeStats) {
        self.state().stats.insert(scope, stats);
    }

    /// Handles one request as the conductor at `addr`.
    pub fn handle(&self, addr: &str, envelope: Envelope) -> Reply {
        let request_id = envelope.request_id;
        let name = envelope.request.name();
        let result = self.dispatch(&envelope.executor, envelope.request);
        match &result {
            Ok(_) => debug!(addr = addr, request = name, request_id, "sim conductor applied"),
            Err(e) => debug!(addr = addr, request = name, request_id, error = %e, "sim conductor rejected"),
        }
        Reply {
            request_id,
            result,
        }
    }

    fn dispatch(&self, executor: &Executor, request: Request) -> Outcome {
        let mut state = self.state();
        if request.is_mutating() {
            state.mutations_received += 1;
        }
        let role = authenticate(&state, executor)?;
        let sensors = self.inner.sensors.as_ref();

        match request {
            Request::Login => Ok(Response::LoggedIn(role)),

            Request::CreateTenant {
                name,
                password,
                quota,
            } => {
                require_admin(role)?;
                require_name("tenant", &name)?;
                if state.tenants.contains_key(&name) {
                    return Err(err(
                        ErrorKind::AlreadyExists,
                        format!("tenant {name} already exists"),
                    ));
                }
                info!(tenant = %name, "tenant created");
                state.tenants.insert(name, TenantEntry { password, quota });
                Ok(Response::Done)
            }
            Request::DeleteTenant { name } => {
                require_admin(role)?;
                if !state.tenants.contains_key(&name) {
                    return Err(not_found("tenant", &name));
                }
                let owned = state.volumes.keys().filter(|(t, _)| *t == name).count();
                if owned > 0 {
                    return Err(err(
                        ErrorKind::PreconditionFailed,
                        format!("tenant {name} still owns {owned} volume(s)"),
                    ));
                }
                state.tenants.remove(&name);
                state.stats.retain(|scope, _| !scope_mentions_tenant(scope, &name));
                info!(tenant = %name, "tenant deleted");
                Ok(Response::Done)
            }
            Request::UpdateTenant {
                name,
                new_name,
                new_password,
                capacity,
                iops,
                bandwidth,
            } => {
                require_admin(role)?;
                update_tenant(
                    &mut state,
                    &name,
                    new_name,
                    new_password,
                    capacity,
                    iops,
                    bandwidth,
                )
            }
            Request::StatTenant { name } => {
                require_scope(role, executor, &name)?;
                state
                    .tenants
                    .get(&name)
                    .map(|t| Response::Tenant(tenant_record(&name, t)))
                    .ok_or_else(|| not_found("tenant", &name))
            }
            Request::ListTenants => {
                require_admin(role)?;
                Ok(Response::Tenants(
                    state
                        .tenants
                        .iter()
                        .map(|(name, t)| tenant_record(name, t))
                        .collect(),
                ))
            }
            Request::CreateAdmin { name, password } => {
                require_admin(role)?;
                require_name("admin", &name)?;
                if state.admins.contains_key(&name) {
                    return Err(err(
                        ErrorKind::AlreadyExists,
                        format!("admin {name} already exists"),
                    ));
                }
                state.admins.insert(name, password);
                Ok(Response::Done)
            }
            Request::DeleteAdmin { name } => {
                require_admin(role)?;
                if !state.admins.contains_key(&name) {
                    return Err(not_found("admin", &name));
                }
                if state.admins.len() == 1 {
                    return Err(err(
                        ErrorKind::PreconditionFailed,
                        format!("admin {name} is the last admin"),
                    ));
                }
                state.admins.remove(&name);
                Ok(Response::Done)
            }

            Request::CreateVolume {
                tenant,
                name,
                size,
                iops,
                bandwidth,
                replicas,
            } => {
                require_scope(role, executor, &tenant)?;
                require_name("volume", &name)?;
                if size == 0 {
                    return Err(err(ErrorKind::InvalidArgument, "volume size must be positive"));
                }
                if !state.tenants.contains_key(&tenant) {
                    return Err(not_found("tenant", &tenant));
                }
                let key = (tenant.clone(), name.clone());
                if state.volumes.contains_key(&key) {
                    return Err(err(
                        ErrorKind::AlreadyExists,
                        format!("volume {tenant}/{name} already exists"),
                    ));
                }
                let replicas = if replicas.is_empty() {
                    state
                        .stores
                        .iter()
                        .filter(|(_, s)| s.status == StoreStatus::Online)
                        .take(DEFAULT_REPLICAS)
                        .map(|(n, _)| n.clone())
                        .collect()
                } else {
                    if let Some(missing) = replicas.iter().find(|r| !state.stores.contains_key(*r)) {
                        return Err(not_found("store", missing));
                    }
                    replicas
                };
                let record = VolumeRecord {
                    tenant,
                    name,
                    size,
                    iops,
                    bandwidth,
                    occupied: 0,
                    replicas,
                };
                state.volumes.insert(key, record.clone());
                Ok(Response::Volume(record))
            }
            Request::DeleteVolume { tenant, name } => {
                require_scope(role, executor, &tenant)?;
                let key = (tenant.clone(), name.clone());
                if !state.volumes.contains_key(&key) {
                    return Err(not_found("volume", &format!("{tenant}/{name}")));
                }
                if state
                    .links
                    .iter()
                    .any(|l| l.tenant == tenant && l.volume == name)
                {
                    return Err(err(
                        ErrorKind::PreconditionFailed,
                        format!("volume {tenant}/{name} has attached clients"),
                    ));
                }
                state.volumes.remove(&key);
                state.stats.remove(&StatsScope::Volume {
                    tenant,
                    volume: name,
                });
                Ok(Response::Done)
            }
            Request::ResizeVolume { tenant, name, size } => {
                require_scope(role, executor, &tenant)?;
                let record = state
                    .volumes
                    .get_mut(&(tenant.clone(), name.clone()))
                    .ok_or_else(|| not_found("volume", &format!("{tenant}/{name}")))?;
                if size < record.occupied {
                    return Err(err(
                        ErrorKind::PreconditionFailed,
                        format!(
                            "volume {tenant}/{name} holds {} bytes, cannot shrink to {size}",
                            record.occupied
                        ),
                    ));
                }
                record.size = size;
                Ok(Response::Volume(record.clone()))
            }
            Request::StatVolume { tenant, name } => {
                require_scope(role, executor, &tenant)?;
                state
                    .volumes
                    .get(&(tenant.clone(), name.clone()))
                    .cloned()
                    .map(Response::Volume)
                    .ok_or_else(|| not_found("volume", &format!("{tenant}/{name}")))
            }
            Request::ListVolumes { tenant } => match tenant {
                Some(tenant) => {
                    require_scope(role, executor, &tenant)?;
                    if !state.tenants.contains_key(&tenant) {
                        return Err(not_found("tenant", &tenant));
                    }
                    Ok(Response::Volumes(
                        state
                            .volumes
                            .values()
                            .filter(|v| v.tenant == tenant)
                            .cloned()
                            .collect(),
                    ))
                }
                None => {
                    require_admin(role)?;
                    Ok(Response::Volumes(state.volumes.values().cloned().collect()))
                }
            },
            Request::ListClientLinks(filter) => {
                require_admin(role)?;
                Ok(Response::ClientLinks(
                    state
                        .links
                        .iter()
                        .filter(|l| filter.matches(l))
                        .cloned()
                        .collect(),
                ))
            }

            Request::AddStore {
                name,
                address_a,
                address_b,
            } => {
                require_admin(role)?;
                require_name("store", &name)?;
                if address_a == address_b {
                    return Err(err(
                        ErrorKind::InvalidArgument,
                        "store daemon addresses must differ",
                    ));
                }
                if state.stores.contains_key(&name) {
                    return Err(err(
                        ErrorKind::AlreadyExists,
                        format!("store {name} already exists"),
                    ));
                }
                if let Some((other, _)) = state.stores.iter().find(|(_, s)| {
                    [&s.address_a, &s.address_b]
                        .iter()
                        .any(|a| **a == address_a || **a == address_b)
                }) {
                    return Err(err(
                        ErrorKind::AlreadyExists,
                        format!("address already registered by store {other}"),
                    ));
                }
                info!(store = %name, "store added");
                state.stores.insert(
                    name,
                    StoreEntry {
                        address_a,
                        address_b,
                        status: StoreStatus::Online,
                        capacity_total: DEFAULT_STORE_CAPACITY,
                        fan_rate: None,
                    },
                );
                Ok(Response::Done)
            }
            Request::DeleteStore { name } => {
                require_admin(role)?;
                if !state.stores.contains_key(&name) {
                    return Err(not_found("store", &name));
                }
                if state.links.iter().any(|l| l.store == name) {
                    return Err(err(
                        ErrorKind::PreconditionFailed,
                        format!("store {name} serves attached clients"),
                    ));
                }
                if state.volumes.values().any(|v| v.replicas.contains(&name)) {
                    return Err(err(
                        ErrorKind::PreconditionFailed,
                        format!("store {name} holds volume replicas"),
                    ));
                }
                state.stores.remove(&name);
                state.stats.remove(&StatsScope::Store(name.clone()));
                info!(store = %name, "store deleted");
                Ok(Response::Done)
            }
            Request::ListStores => {
                require_admin(role)?;
                Ok(Response::Stores(
                    state
                        .stores
                        .keys()
                        .filter_map(|n| store_record(&state, n))
                        .collect(),
                ))
            }
            Request::StatStore { name } => {
                require_admin(role)?;
                let store = store_record(&state, &name).ok_or_else(|| not_found("store", &name))?;
                Ok(Response::StoreDetail(Box::new(StoreDetail {
                    fans: fans(&state, sensors, &name),
                    powers: sensors.powers(&name),
                    trays: sensors.trays(&name),
                    bccs: sensors.bccs(&name),
                    rges: sensors.rges(&name),
                    host_ports: sensors.host_ports(&name),
                    store,
                })))
            }
            Request::StatCluster => {
                require_admin(role)?;
                let (total, avail) = state
                    .stores
                    .keys()
                    .filter_map(|n| store_record(&state, n))
                    .fold((0u64, 0u64), |(t, a), s| {
                        (t + s.capacity_total, a + s.capacity_available)
                    });
                let kb = total / 1024;
                let kb_avail = avail / 1024;
                Ok(Response::Capacity(ClusterCapacity {
                    kb,
                    kb_avail,
                    kb_used: kb - kb_avail,
                }))
            }
            Request::StatConductor { ip } => {
                require_admin(role)?;
                state
                    .roles
                    .get(&ip)
                    .map(|role| Response::Conductor(ConductorInfo { ip: ip.clone(), role: *role }))
                    .ok_or_else(|| not_found("conductor", &ip))
            }
            Request::SetConductorRole { ip, role: target } => {
                require_admin(role)?;
                if !state.roles.contains_key(&ip) {
                    return Err(not_found("conductor", &ip));
                }
                if target == ConductorRole::Leader {
                    for (other, r) in state.roles.iter_mut() {
                        if *other != ip && *r == ConductorRole::Leader {
                            info!(conductor = %other, "demoting previous leader");
                            *r = ConductorRole::Follower;
                        }
                    }
                }
                state.roles.insert(ip.clone(), target);
                info!(conductor = %ip, role = %target, "conductor role changed");
                Ok(Response::Done)
            }

            Request::ListFans { store } => {
                require_store(&state, role, &store)?;
                Ok(Response::Fans(fans(&state, sensors, &store)))
            }
            Request::ListPowers { store } => {
                require_store(&state, role, &store)?;
                Ok(Response::Powers(sensors.powers(&store)))
            }
            Request::ListTrays { store } => {
                require_store(&state, role, &store)?;
                Ok(Response::Trays(sensors.trays(&store)))
            }
            Request::ListBccs { store } => {
                require_store(&state, role, &store)?;
                Ok(Response::Bccs(sensors.bccs(&store)))
            }
            Request::ListRges { store } => {
                require_store(&state, role, &store)?;
                Ok(Response::Rges(sensors.rges(&store)))
            }
            Request::ListHostPorts { store } => {
                require_store(&state, role, &store)?;
                Ok(Response::HostPorts(sensors.host_ports(&store)))
            }

            Request::OccupiedSize { tenant, volume } => {
                require_scope(role, executor, &tenant)?;
                if !state.tenants.contains_key(&tenant) {
                    return Err(not_found("tenant", &tenant));
                }
                match volume {
                    Some(volume) => state
                        .volumes
                        .get(&(tenant.clone(), volume.clone()))
                        .map(|v| Response::Size(v.occupied))
                        .ok_or_else(|| not_found("volume", &format!("{tenant}/{volume}"))),
                    None => Ok(Response::Size(
                        state
                            .volumes
                            .values()
                            .filter(|v| v.tenant == tenant)
                            .map(|v| v.occupied)
                            .sum(),
                    )),
                }
            }
            Request::RealtimeStatistics(scope) => {
                match &scope {
                    StatsScope::Store(store) => require_store(&state, role, store)?,
                    StatsScope::Tenant(tenant) => {
                        require_scope(role, executor, tenant)?;
                        if !state.tenants.contains_key(tenant) {
                            return Err(not_found("tenant", tenant));
                        }
                    }
                    StatsScope::Volume { tenant, volume } => {
                        require_scope(role, executor, tenant)?;
                        if !state
                            .volumes
                            .contains_key(&(tenant.clone(), volume.clone()))
                        {
                            return Err(not_found("volume", &format!("{tenant}/{volume}")));
                        }
                    }
                }
                Ok(Response::Statistics(
                    state.stats.get(&scope).copied().unwrap_or_default(),
                ))
            }
            Request::PowerOff { store } => {
                require_store(&state, role, &store)?;
                if let Some(entry) = state.stores.get_mut(&store) {
                    entry.status = StoreStatus::PoweringOff;
                }
                info!(store = %store, "power off accepted");
                Ok(Response::Done)
            }
            Request::SetFanSpeed { store, rate } => {
                require_store(&state, role, &store)?;
                if rate > MAX_FAN_RATE {
                    return Err(err(
                        ErrorKind::InvalidArgument,
                        format!("fan rate {rate} exceeds {MAX_FAN_RATE}"),
                    ));
                }
                let rate = rate as i32;
                if let Some(entry) = state.stores.get_mut(&store) {
                    entry.fan_rate = Some(rate);
                }
                Ok(Response::FanSpeed(fan_speed(rate)))
            }
        }
    }
}

impl std::fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCluster")
            .field("addrs", &self.inner.addrs)
            .finish()
    }
}

fn authenticate(
    state: &ClusterState,
    executor: &Executor,
) -> std::result::Result<ExecutorRole, RemoteError> {
    if state.admins.get(&executor.name) == Some(&executor.credential) {
        return Ok(ExecutorRole::Admin);
    }
    match state.tenants.get(&executor.name) {
        Some(t) if t.password == executor.credential => Ok(ExecutorRole::Tenant),
        _ => Err(err(
            ErrorKind::PermissionDenied,
            format!("invalid credentials for {}", executor.name),
        )),
    }
}

fn require_admin(role: ExecutorRole) -> std::result::Result<(), RemoteError> {
    match role {
        ExecutorRole::Admin => Ok(()),
        ExecutorRole::Tenant => Err(err(
            ErrorKind::PermissionDenied,
            "admin privileges required",
        )),
    }
}

fn require_scope(
    role: ExecutorRole,
    executor: &Executor,
    tenant: &str,
) -> std::result::Result<(), RemoteError> {
    if role == ExecutorRole::Admin || executor.name == tenant {
        Ok(())
    } else {
        Err(err(
            ErrorKind::PermissionDenied,
            format!("{} may not access tenant {tenant}", executor.name),
        ))
    }
}

fn require_store(
    state: &ClusterState,
    role: ExecutorRole,
    store: &str,
) -> std::result::Result<(), RemoteError> {
    require_admin(role)?;
    if state.stores.contains_key(store) {
        Ok(())
    } else {
        Err(not_found("store", store))
    }
}

fn require_name(what: &str, name: &str) -> std::result::Result<(), RemoteError> {
    if name.is_empty() {
        Err(err(
            ErrorKind::InvalidArgument,
            format!("{what} name must not be empty"),
        ))
    } else {
        Ok(())
    }
}

fn not_found(what: &str, name: &str) -> RemoteError {
    err(ErrorKind::NotFound, format!("{what} {name} not found"))
}

fn tenant_record(name: &str, entry: &TenantEntry) -> TenantRecord {
    TenantRecord {
        name: name.to_string(),
        quota: entry.quota,
    }
}

fn scope_mentions_tenant(scope: &StatsScope, tenant: &str) -> bool {
    match scope {
        StatsScope::Tenant(t) => t == tenant,
        StatsScope::Volume { tenant: t, .. } => t == tenant,
        StatsScope::Store(_) => false,
    }
}

#[allow(clippy::too_many_arguments)]
fn update_tenant(
    state: &mut ClusterState,
    name: &str,
    new_name: Option<String>,
    new_password: Option<String>,
    capacity: Option<u64>,
    iops: Option<u64>,
    bandwidth: Option<u64>,
) -> Outcome {
    if !state.tenants.contains_key(name) {
        return Err(not_found("tenant", name));
    }
    if let Some(target) = new_name.as_deref() {
        require_name("tenant", target)?;
        if target != name && state.tenants.contains_key(target) {
            return Err(err(
                ErrorKind::AlreadyExists,
                format!("tenant {target} already exists"),
            ));
        }
    }

    let Some(mut entry) = state.tenants.remove(name) else {
        return Err(not_found("tenant", name));
    };
    if let Some(password) = new_password {
        entry.password = password;
    }
    if let Some(capacity) = capacity {
        entry.quota.capacity = capacity;
    }
    if let Some(iops) = iops {
        entry.quota.iops = iops;
    }
    if let Some(bandwidth) = bandwidth {
        entry.quota.bandwidth = bandwidth;
    }

    let final_name = new_name.unwrap_or_else(|| name.to_string());
    if final_name != name {
        let moved: Vec<_> = state
            .volumes
            .keys()
            .filter(|(t, _)| t == name)
            .cloned()
            .collect();
        for key in moved {
            if let Some(mut volume) = state.volumes.remove(&key) {
                volume.tenant = final_name.clone();
                state
                    .volumes
                    .insert((final_name.clone(), key.1.clone()), volume);
            }
        }
        for link in state.links.iter_mut().filter(|l| l.tenant == name) {
            link.tenant = final_name.clone();
        }
        state.stats.retain(|scope, _| !scope_mentions_tenant(scope, name));
        info!(from = %name, to = %final_name, "tenant renamed");
    }

    let record = tenant_record(&final_name, &entry);
    state.tenants.insert(final_name, entry);
    Ok(Response::Tenant(record))
}

fn store_record(state: &ClusterState, name: &str) -> Option<StoreRecord> {
    let entry = state.stores.get(name)?;
    let used: u64 = state
        .volumes
        .values()
        .filter(|v| v.replicas.iter().any(|r| r == name))
        .map(|v| v.occupied)
        .sum();
    Some(StoreRecord {
        name: name.to_string(),
        address_a: entry.address_a.clone(),
        address_b: entry.address_b.clone(),
        status: entry.status,
        capacity_total: entry.capacity_total,
        capacity_available: entry.capacity_total.saturating_sub(used),
    })
}

fn fan_speed(rate: i32) -> i32 {
    FAN_MAX_RPM * rate / MAX_FAN_RATE as i32
}

fn fans(state: &ClusterState, sensors: &dyn SensorProbe, store: &str) -> Vec<FanInfo> {
    let mut fans = sensors.fans(store);
    if let Some(rate) = state.stores.get(store).and_then(|s| s.fan_rate) {
        for fan in fans.iter_mut() {
            fan.rate = rate;
            fan.speed = fan_speed(rate);
        }
    }
    fans
}

// ============================================================================
// Transport
// ============================================================================

/// Transport that delivers requests to a [`SimCluster`] in process.
///
/// Messages still pass through bincode so both ends see exactly what a wire would carry.
#[derive(Debug, Clone)]
pub struct SimTransport {
    cluster: SimCluster,
}

#[async_trait]
impl ConductorTransport for SimTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn ConductorConnection>> {
        if !self.cluster.is_online(addr) {
            return Err(TransportError::ConnectionRefused {
                addr: addr.to_string(),
            });
        }
        Ok(Box::new(SimConnection {
            cluster: self.cluster.clone(),
            addr: addr.to_string(),
            pending: None,
            lost: false,
        }))
    }
}

struct SimConnection {
    cluster: SimCluster,
    addr: String,
    pending: Option<Vec<u8>>,
    lost: bool,
}

#[async_trait]
impl ConductorConnection for SimConnection {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        if !self.cluster.is_online(&self.addr) {
            return Err(TransportError::ConnectionReset);
        }
        let wire = serialize_message(envelope)?;
        let envelope: Envelope = deserialize_message(&wire)?;
        let reply = self.cluster.handle(&self.addr, envelope);
        if self.cluster.take_drop(&self.addr) {
            debug!(addr = %self.addr, request_id = reply.request_id, "sim conductor dropped reply");
            self.pending = None;
            self.lost = true;
        } else {
            self.pending = Some(serialize_message(&reply)?);
            self.lost = false;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Reply> {
        if self.lost {
            return std::future::pending::<Result<Reply>>().await;
        }
        if !self.cluster.is_online(&self.addr) {
            return Err(TransportError::ConnectionReset);
        }
        let wire = self.pending.take().ok_or(TransportError::NotConnected)?;
        deserialize_message(&wire)
    }

    fn peer_addr(&self) -> &str {
        &self.addr
    }
}

/// One simulated conductor exposed as a [`ConductorService`].
#[derive(Debug, Clone)]
pub struct SimConductor {
    cluster: SimCluster,
    addr: String,
}

impl ConductorService for SimConductor {
    fn handle(&self, envelope: Envelope) -> Option<Reply> {
        if !self.cluster.is_online(&self.addr) {
            return None;
        }
        let reply = self.cluster.handle(&self.addr, envelope);
        if self.cluster.take_drop(&self.addr) {
            None
        } else {
            Some(reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Executor {
        Executor::new(DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD)
    }

    fn run(sim: &SimCluster, executor: &Executor, request: Request) -> Outcome {
        sim.handle(
            "10.0.0.1",
            Envelope {
                request_id: 1,
                executor: executor.clone(),
                request,
            },
        )
        .result
    }

    fn create_tenant(sim: &SimCluster, name: &str) {
        run(
            sim,
            &admin(),
            Request::CreateTenant {
                name: name.to_string(),
                password: format!("{name}-pw"),
                quota: Quota::new(1 << 30, 1000, 1 << 20),
            },
        )
        .unwrap();
    }

    fn add_store(sim: &SimCluster, name: &str, a: &str, b: &str) {
        run(
            sim,
            &admin(),
            Request::AddStore {
                name: name.to_string(),
                address_a: a.to_string(),
                address_b: b.to_string(),
            },
        )
        .unwrap();
    }

    fn create_volume(sim: &SimCluster, tenant: &str, name: &str, replicas: &[&str]) {
        run(
            sim,
            &admin(),
            Request::CreateVolume {
                tenant: tenant.to_string(),
                name: name.to_string(),
                size: 1 << 30,
                iops: 100,
                bandwidth: 1 << 20,
                replicas: replicas.iter().map(|s| s.to_string()).collect(),
            },
        )
        .unwrap();
    }

    #[test]
    fn test_login_roles() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        create_tenant(&sim, "acme");
        assert_eq!(
            run(&sim, &admin(), Request::Login).unwrap(),
            Response::LoggedIn(ExecutorRole::Admin)
        );
        assert_eq!(
            run(&sim, &Executor::new("acme", "acme-pw"), Request::Login).unwrap(),
            Response::LoggedIn(ExecutorRole::Tenant)
        );
        let denied = run(&sim, &Executor::new("acme", "wrong"), Request::Login).unwrap_err();
        assert_eq!(denied.kind, ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_repeated_mutations_are_idempotent() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        create_tenant(&sim, "acme");
        let again = run(
            &sim,
            &admin(),
            Request::CreateTenant {
                name: "acme".to_string(),
                password: "x".to_string(),
                quota: Quota::default(),
            },
        )
        .unwrap_err();
        assert_eq!(again.kind, ErrorKind::AlreadyExists);

        let delete = Request::DeleteTenant {
            name: "acme".to_string(),
        };
        run(&sim, &admin(), delete.clone()).unwrap();
        assert_eq!(
            run(&sim, &admin(), delete).unwrap_err().kind,
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_tenant_with_volumes_cannot_be_deleted() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        create_tenant(&sim, "acme");
        create_volume(&sim, "acme", "vol1", &[]);
        let e = run(
            &sim,
            &admin(),
            Request::DeleteTenant {
                name: "acme".to_string(),
            },
        )
        .unwrap_err();
        assert_eq!(e.kind, ErrorKind::PreconditionFailed);
    }

    #[test]
    fn test_tenant_scope_enforced() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        create_tenant(&sim, "acme");
        create_tenant(&sim, "globex");
        let acme = Executor::new("acme", "acme-pw");
        assert!(run(
            &sim,
            &acme,
            Request::StatTenant {
                name: "acme".to_string()
            }
        )
        .is_ok());
        let e = run(
            &sim,
            &acme,
            Request::StatTenant {
                name: "globex".to_string(),
            },
        )
        .unwrap_err();
        assert_eq!(e.kind, ErrorKind::PermissionDenied);
        let e = run(&sim, &acme, Request::ListStores).unwrap_err();
        assert_eq!(e.kind, ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_leader_transition_demotes_previous_leader() {
        let sim = SimCluster::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(sim.leaders(), vec!["10.0.0.1".to_string()]);
        run(
            &sim,
            &admin(),
            Request::SetConductorRole {
                ip: "10.0.0.3".to_string(),
                role: ConductorRole::Leader,
            },
        )
        .unwrap();
        assert_eq!(sim.leaders(), vec!["10.0.0.3".to_string()]);
        assert_eq!(sim.role("10.0.0.1"), Some(ConductorRole::Follower));
    }

    #[test]
    fn test_store_with_replicas_or_links_cannot_be_deleted() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        add_store(&sim, "store1", "10.0.1.1", "10.0.1.2");
        add_store(&sim, "store2", "10.0.2.1", "10.0.2.2");
        create_tenant(&sim, "acme");
        create_volume(&sim, "acme", "vol1", &["store1"]);
        sim.attach_link(ClientLinkRecord {
            client_ip: "10.1.0.5".to_string(),
            client_port: 5000,
            nic_ip: "10.0.2.1".to_string(),
            nic_port: 49162,
            tenant: "acme".to_string(),
            volume: "vol1".to_string(),
            store: "store2".to_string(),
        })
        .unwrap();

        for store in ["store1", "store2"] {
            let e = run(
                &sim,
                &admin(),
                Request::DeleteStore {
                    name: store.to_string(),
                },
            )
            .unwrap_err();
            assert_eq!(e.kind, ErrorKind::PreconditionFailed);
        }

        assert!(sim.detach_link("10.1.0.5", 5000));
        run(
            &sim,
            &admin(),
            Request::DeleteStore {
                name: "store2".to_string(),
            },
        )
        .unwrap();
    }

    #[test]
    fn test_occupied_size_sums_volumes() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        create_tenant(&sim, "acme");
        for (vol, bytes) in [("v1", 100u64), ("v2", 250), ("v3", 0)] {
            create_volume(&sim, "acme", vol, &[]);
            sim.record_write("acme", vol, bytes).unwrap();
        }
        let total = run(
            &sim,
            &admin(),
            Request::OccupiedSize {
                tenant: "acme".to_string(),
                volume: None,
            },
        )
        .unwrap();
        assert_eq!(total, Response::Size(350));
    }

    #[test]
    fn test_fan_rate_bounds_and_speed() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        add_store(&sim, "store1", "10.0.1.1", "10.0.1.2");
        let speed = run(
            &sim,
            &admin(),
            Request::SetFanSpeed {
                store: "store1".to_string(),
                rate: 10_000,
            },
        )
        .unwrap();
        assert_eq!(speed, Response::FanSpeed(FAN_MAX_RPM));
        let e = run(
            &sim,
            &admin(),
            Request::SetFanSpeed {
                store: "store1".to_string(),
                rate: 10_001,
            },
        )
        .unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);
        match run(
            &sim,
            &admin(),
            Request::ListFans {
                store: "store1".to_string(),
            },
        )
        .unwrap()
        {
            Response::Fans(fans) => assert!(fans.iter().all(|f| f.rate == 10_000)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rename_moves_volumes() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        create_tenant(&sim, "acme");
        create_volume(&sim, "acme", "vol1", &[]);
        run(
            &sim,
            &admin(),
            Request::UpdateTenant {
                name: "acme".to_string(),
                new_name: Some("acme2".to_string()),
                new_password: None,
                capacity: None,
                iops: Some(5),
                bandwidth: None,
            },
        )
        .unwrap();
        let volumes = run(
            &sim,
            &admin(),
            Request::ListVolumes {
                tenant: Some("acme2".to_string()),
            },
        )
        .unwrap();
        match volumes {
            Response::Volumes(v) => assert_eq!(v.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_conductor_ip_strips_port() {
        assert_eq!(conductor_ip("10.0.0.1:49180"), "10.0.0.1");
        assert_eq!(conductor_ip("10.0.0.1"), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_stopped_conductor_refuses_connections() {
        let sim = SimCluster::new(&["10.0.0.1"]);
        sim.stop("10.0.0.1");
        let transport = sim.transport();
        assert!(matches!(
            transport.connect("10.0.0.1").await.err(),
            Some(TransportError::ConnectionRefused { .. })
        ));
        sim.start("10.0.0.1");
        assert!(transport.connect("10.0.0.1").await.is_ok());
    }
}
