//! Request and reply messages exchanged between management clients and conductors.
//!
//! Messages are serialized with bincode and carried in frames (see [`crate::protocol`]).

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Serialize any serde-compatible message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Deserialize bytes to a message using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// IP part of a conductor address (`ip` or `ip:port`).
pub fn conductor_ip(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Kind of a failure surfaced at the management boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed name, address, quota or rate.
    InvalidArgument,
    /// The executor lacks the required scope.
    PermissionDenied,
    /// No conductor could be contacted.
    Unreachable,
    /// Entity does not exist.
    NotFound,
    /// Entity already exists.
    AlreadyExists,
    /// A structural constraint is violated.
    PreconditionFailed,
    /// The request conflicts with the observed cluster state.
    Conflict,
    /// A local allocation failed.
    OutOfMemory,
    /// The call deadline expired.
    DeadlineExceeded,
    /// Unexpected conductor or protocol failure.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::PreconditionFailed => "precondition failed",
            ErrorKind::Conflict => "conflict",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::DeadlineExceeded => "deadline exceeded",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Error answered by a conductor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Failure kind.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub detail: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Identity a request is issued on behalf of.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executor {
    /// Admin or tenant name.
    pub name: String,
    /// Credential presented with every request.
    pub credential: String,
}

impl Executor {
    /// Creates an executor identity.
    pub fn new(name: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential: credential.into(),
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Scope granted to an authenticated executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorRole {
    /// Cluster-wide administrator.
    Admin,
    /// Tenant restricted to its own resources.
    Tenant,
}

// ============================================================================
// Tenants and volumes
// ============================================================================

/// Capacity, IOPS and bandwidth limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Capacity in bytes.
    pub capacity: u64,
    /// I/O operations per second.
    pub iops: u64,
    /// Bandwidth in bytes per second.
    pub bandwidth: u64,
}

impl Quota {
    /// Creates a quota.
    pub fn new(capacity: u64, iops: u64, bandwidth: u64) -> Self {
        Self {
            capacity,
            iops,
            bandwidth,
        }
    }
}

/// Tenant as stored by the conductors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Unique tenant name.
    pub name: String,
    /// Assigned quota.
    pub quota: Quota,
}

/// Volume metadata as stored by the conductors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Owning tenant.
    pub tenant: String,
    /// Name, unique within the tenant.
    pub name: String,
    /// Provisioned size in bytes.
    pub size: u64,
    /// IOPS quota.
    pub iops: u64,
    /// Bandwidth quota in bytes per second.
    pub bandwidth: u64,
    /// Bytes actually written.
    pub occupied: u64,
    /// Stores holding a replica.
    pub replicas: Vec<String>,
}

/// Data-path client attached to a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLinkRecord {
    /// Client address.
    pub client_ip: String,
    /// Client port.
    pub client_port: u16,
    /// Target nic address on the store.
    pub nic_ip: String,
    /// Target nic port.
    pub nic_port: u16,
    /// Tenant owning the volume.
    pub tenant: String,
    /// Attached volume.
    pub volume: String,
    /// Store serving the link.
    pub store: String,
}

/// Selects which client links to list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientLinkFilter {
    /// Every link in the cluster.
    All,
    /// Links to volumes of one tenant.
    Tenant(String),
    /// Links to one volume.
    Volume {
        /// Owning tenant.
        tenant: String,
        /// Volume name.
        volume: String,
    },
    /// Links served by one store.
    Store(String),
}

impl ClientLinkFilter {
    /// Whether `link` is selected by this filter.
    pub fn matches(&self, link: &ClientLinkRecord) -> bool {
        match self {
            ClientLinkFilter::All => true,
            ClientLinkFilter::Tenant(t) => &link.tenant == t,
            ClientLinkFilter::Volume { tenant, volume } => {
                &link.tenant == tenant && &link.volume == volume
            }
            ClientLinkFilter::Store(s) => &link.store == s,
        }
    }
}

// ============================================================================
// Topology
// ============================================================================

/// Operational status of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    /// Serving I/O.
    Online,
    /// Not answering its management channel.
    Offline,
    /// A power-off command was accepted.
    PoweringOff,
}

/// Storage node registered with the conductors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Unique store name.
    pub name: String,
    /// Address of daemon 0.
    pub address_a: String,
    /// Address of daemon 1.
    pub address_b: String,
    /// Last known status.
    pub status: StoreStatus,
    /// Raw capacity in bytes.
    pub capacity_total: u64,
    /// Free capacity in bytes.
    pub capacity_available: u64,
}

/// Role of a conductor in the consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConductorRole {
    /// Current leader.
    Leader,
    /// Replicating follower.
    Follower,
    /// Candidate or unknown.
    Unknown,
}

impl fmt::Display for ConductorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConductorRole::Leader => f.write_str("leader"),
            ConductorRole::Follower => f.write_str("follower"),
            ConductorRole::Unknown => f.write_str("unknown"),
        }
    }
}

/// Observed state of one conductor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductorInfo {
    /// Conductor IP.
    pub ip: String,
    /// Role reported by the cluster.
    pub role: ConductorRole,
}

/// Aggregate capacity of all stores, in KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCapacity {
    /// Total capacity.
    pub kb: u64,
    /// Available capacity.
    pub kb_avail: u64,
    /// Used capacity.
    pub kb_used: u64,
}

// ============================================================================
// Hardware snapshots
// ============================================================================

/// Status reported by a hardware component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentStatus {
    /// Working.
    Ok,
    /// Not plugged in.
    NotPlugged,
    /// Device error.
    DeviceError,
    /// Invalid device.
    InvalidDevice,
    /// I/O error while polling.
    IoError,
}

/// Fan snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanInfo {
    /// Fan name.
    pub name: String,
    /// Component status.
    pub status: ComponentStatus,
    /// Speed in rpm.
    pub speed: i32,
    /// Speed rate, percentage times 100.
    pub rate: i32,
}

/// Power supply snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerInfo {
    /// Power supply name.
    pub name: String,
    /// Component status.
    pub status: ComponentStatus,
    /// Input is normal.
    pub input_ok: bool,
    /// Output is normal.
    pub output_ok: bool,
    /// Internal fan is normal.
    pub fan_ok: bool,
    /// Temperature sensors, degrees Celsius.
    pub temperatures: Vec<f64>,
    /// Output current, A.
    pub output_current: f64,
    /// Input current, A.
    pub input_current: f64,
    /// Output voltage, V.
    pub output_voltage: f64,
    /// Input voltage, V.
    pub input_voltage: f64,
    /// Power draw, W.
    pub watts: f64,
}

/// Disk set inside a tray.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraySetInfo {
    /// Set name.
    pub name: String,
    /// Component status.
    pub status: ComponentStatus,
    /// Hardware model.
    pub model: String,
    /// Bit version.
    pub bit: i32,
    /// Temperature, degrees Celsius.
    pub temperature: f64,
}

/// Tray module snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrayInfo {
    /// Tray name.
    pub name: String,
    /// Component status.
    pub status: ComponentStatus,
    /// Hardware model.
    pub model: String,
    /// Bit version.
    pub bit: i32,
    /// Firmware version.
    pub firmware: u32,
    /// Temperature, degrees Celsius.
    pub temperature: f64,
    /// Raw capacity, MB.
    pub raw_capacity_mb: u64,
    /// Usable capacity, MB.
    pub usable_capacity_mb: u64,
    /// Disk sets in the tray.
    pub sets: Vec<TraySetInfo>,
}

/// RGE module snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RgeInfo {
    /// Module name.
    pub name: String,
    /// Component status.
    pub status: ComponentStatus,
    /// Hardware model.
    pub model: String,
    /// Bit version.
    pub bit: i32,
    /// Temperature, degrees Celsius.
    pub temperature: f64,
}

/// BCC module snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BccInfo {
    /// Module name.
    pub name: String,
    /// Component status.
    pub status: ComponentStatus,
    /// Hardware model.
    pub model: String,
    /// Temperature, degrees Celsius.
    pub temperature: f64,
}

/// Host port snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPortInfo {
    /// Port name.
    pub name: String,
    /// IPv4 address.
    pub ip: String,
    /// MAC address.
    pub mac: String,
    /// Netmask.
    pub mask: String,
    /// Link status.
    pub status: ComponentStatus,
}

/// Store record with all hardware snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDetail {
    /// General store information.
    pub store: StoreRecord,
    /// Fans.
    pub fans: Vec<FanInfo>,
    /// Power supplies.
    pub powers: Vec<PowerInfo>,
    /// Tray modules.
    pub trays: Vec<TrayInfo>,
    /// BCC modules.
    pub bccs: Vec<BccInfo>,
    /// RGE modules.
    pub rges: Vec<RgeInfo>,
    /// Host ports.
    pub host_ports: Vec<HostPortInfo>,
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time I/O statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeStats {
    /// Operations per second.
    pub iops: u64,
    /// Bytes per second.
    pub bandwidth: u64,
    /// Latency in microseconds.
    pub latency_us: u64,
}

/// Entity a statistics snapshot is taken for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatsScope {
    /// One store.
    Store(String),
    /// One tenant.
    Tenant(String),
    /// One volume.
    Volume {
        /// Owning tenant.
        tenant: String,
        /// Volume name.
        volume: String,
    },
}

// ============================================================================
// Requests
// ============================================================================

/// Control-plane request handled by a conductor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Verify the executor credential and return its role.
    Login,
    /// Create a tenant.
    CreateTenant {
        /// Tenant name.
        name: String,
        /// Tenant credential.
        password: String,
        /// Initial quota.
        quota: Quota,
    },
    /// Delete a tenant that owns no volumes.
    DeleteTenant {
        /// Tenant name.
        name: String,
    },
    /// Update selected tenant fields; `None` leaves a field unchanged.
    UpdateTenant {
        /// Current tenant name.
        name: String,
        /// New name.
        new_name: Option<String>,
        /// New credential.
        new_password: Option<String>,
        /// New capacity.
        capacity: Option<u64>,
        /// New IOPS limit.
        iops: Option<u64>,
        /// New bandwidth limit.
        bandwidth: Option<u64>,
    },
    /// Read one tenant.
    StatTenant {
        /// Tenant name.
        name: String,
    },
    /// List all tenants.
    ListTenants,
    /// Create an admin identity.
    CreateAdmin {
        /// Admin name.
        name: String,
        /// Admin credential.
        password: String,
    },
    /// Delete an admin identity.
    DeleteAdmin {
        /// Admin name.
        name: String,
    },
    /// Create volume metadata.
    CreateVolume {
        /// Owning tenant.
        tenant: String,
        /// Volume name.
        name: String,
        /// Provisioned size.
        size: u64,
        /// IOPS quota.
        iops: u64,
        /// Bandwidth quota.
        bandwidth: u64,
        /// Stores to place replicas on.
        replicas: Vec<String>,
    },
    /// Delete volume metadata.
    DeleteVolume {
        /// Owning tenant.
        tenant: String,
        /// Volume name.
        name: String,
    },
    /// Change the provisioned size of a volume.
    ResizeVolume {
        /// Owning tenant.
        tenant: String,
        /// Volume name.
        name: String,
        /// New size.
        size: u64,
    },
    /// Read one volume.
    StatVolume {
        /// Owning tenant.
        tenant: String,
        /// Volume name.
        name: String,
    },
    /// List volumes of one tenant, or of the whole cluster.
    ListVolumes {
        /// Tenant filter.
        tenant: Option<String>,
    },
    /// List attached data-path clients.
    ListClientLinks(ClientLinkFilter),
    /// Register a store.
    AddStore {
        /// Store name.
        name: String,
        /// Daemon 0 address.
        address_a: String,
        /// Daemon 1 address.
        address_b: String,
    },
    /// Unregister a store.
    DeleteStore {
        /// Store name.
        name: String,
    },
    /// List all stores.
    ListStores,
    /// Read one store with its hardware.
    StatStore {
        /// Store name.
        name: String,
    },
    /// Aggregate cluster capacity.
    StatCluster,
    /// Read the role of one conductor.
    StatConductor {
        /// Conductor IP.
        ip: String,
    },
    /// Command a role transition.
    SetConductorRole {
        /// Conductor IP.
        ip: String,
        /// Target role.
        role: ConductorRole,
    },
    /// List fans of a store.
    ListFans {
        /// Store name.
        store: String,
    },
    /// List power supplies of a store.
    ListPowers {
        /// Store name.
        store: String,
    },
    /// List tray modules of a store.
    ListTrays {
        /// Store name.
        store: String,
    },
    /// List BCC modules of a store.
    ListBccs {
        /// Store name.
        store: String,
    },
    /// List RGE modules of a store.
    ListRges {
        /// Store name.
        store: String,
    },
    /// List host ports of a store.
    ListHostPorts {
        /// Store name.
        store: String,
    },
    /// Occupied bytes of one volume or of a whole tenant.
    OccupiedSize {
        /// Tenant name.
        tenant: String,
        /// Volume name.
        volume: Option<String>,
    },
    /// Realtime statistics snapshot.
    RealtimeStatistics(StatsScope),
    /// Power off a store.
    PowerOff {
        /// Store name.
        store: String,
    },
    /// Set the fan speed rate of a store.
    SetFanSpeed {
        /// Store name.
        store: String,
        /// Percentage times 100.
        rate: u32,
    },
}

impl Request {
    /// Short name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Login => "login",
            Request::CreateTenant { .. } => "create_tenant",
            Request::DeleteTenant { .. } => "delete_tenant",
            Request::UpdateTenant { .. } => "update_tenant",
            Request::StatTenant { .. } => "stat_tenant",
            Request::ListTenants => "list_tenants",
            Request::CreateAdmin { .. } => "create_admin",
            Request::DeleteAdmin { .. } => "delete_admin",
            Request::CreateVolume { .. } => "create_volume",
            Request::DeleteVolume { .. } => "delete_volume",
            Request::ResizeVolume { .. } => "resize_volume",
            Request::StatVolume { .. } => "stat_volume",
            Request::ListVolumes { .. } => "list_volumes",
            Request::ListClientLinks(_) => "list_client_links",
            Request::AddStore { .. } => "add_store",
            Request::DeleteStore { .. } => "delete_store",
            Request::ListStores => "list_stores",
            Request::StatStore { .. } => "stat_store",
            Request::StatCluster => "stat_cluster",
            Request::StatConductor { .. } => "stat_conductor",
            Request::SetConductorRole { .. } => "set_conductor_role",
            Request::ListFans { .. } => "list_fans",
            Request::ListPowers { .. } => "list_powers",
            Request::ListTrays { .. } => "list_trays",
            Request::ListBccs { .. } => "list_bccs",
            Request::ListRges { .. } => "list_rges",
            Request::ListHostPorts { .. } => "list_host_ports",
            Request::OccupiedSize { .. } => "occupied_size",
            Request::RealtimeStatistics(_) => "realtime_statistics",
            Request::PowerOff { .. } => "power_off",
            Request::SetFanSpeed { .. } => "set_fan_speed",
        }
    }

    /// Whether the request changes cluster state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Request::CreateTenant { .. }
                | Request::DeleteTenant { .. }
                | Request::UpdateTenant { .. }
                | Request::CreateAdmin { .. }
                | Request::DeleteAdmin { .. }
                | Request::CreateVolume { .. }
                | Request::DeleteVolume { .. }
                | Request::ResizeVolume { .. }
                | Request::AddStore { .. }
                | Request::DeleteStore { .. }
                | Request::SetConductorRole { .. }
                | Request::PowerOff { .. }
                | Request::SetFanSpeed { .. }
        )
    }
}

/// Successful answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Mutation applied.
    Done,
    /// Credential accepted.
    LoggedIn(ExecutorRole),
    /// One tenant.
    Tenant(TenantRecord),
    /// Tenant listing.
    Tenants(Vec<TenantRecord>),
    /// One volume.
    Volume(VolumeRecord),
    /// Volume listing.
    Volumes(Vec<VolumeRecord>),
    /// Client link listing.
    ClientLinks(Vec<ClientLinkRecord>),
    /// Store listing.
    Stores(Vec<StoreRecord>),
    /// One store with hardware.
    StoreDetail(Box<StoreDetail>),
    /// Cluster capacity.
    Capacity(ClusterCapacity),
    /// One conductor.
    Conductor(ConductorInfo),
    /// Fan listing.
    Fans(Vec<FanInfo>),
    /// Power supply listing.
    Powers(Vec<PowerInfo>),
    /// Tray listing.
    Trays(Vec<TrayInfo>),
    /// BCC listing.
    Bccs(Vec<BccInfo>),
    /// RGE listing.
    Rges(Vec<RgeInfo>),
    /// Host port listing.
    HostPorts(Vec<HostPortInfo>),
    /// Occupied bytes.
    Size(u64),
    /// Statistics snapshot.
    Statistics(RealtimeStats),
    /// Fan speed after a rate change.
    FanSpeed(i32),
}

/// Request frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlates the reply.
    pub request_id: u64,
    /// Identity issuing the request.
    pub executor: Executor,
    /// The request.
    pub request: Request,
}

/// Reply frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// Request being answered.
    pub request_id: u64,
    /// Response or conductor-side error.
    pub result: std::result::Result<Response, RemoteError>,
}

impl Reply {
    /// Successful reply.
    pub fn ok(request_id: u64, response: Response) -> Self {
        Self {
            request_id,
            result: Ok(response),
        }
    }

    /// Error reply.
    pub fn err(request_id: u64, error: RemoteError) -> Self {
        Self {
            request_id,
            result: Err(error),
        }
    }
}
