//! `s5mgr` command line: one subcommand per management operation, JSON on stdout.

use crate::config::MgmtConfig;
use crate::context::ExecutionContext;
use crate::manager::Manager;
use crate::quota::{TenantUpdate, VolumeSpec, UNCHANGED};
use crate::validate;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use s5_conductor::{
    ClientLinkFilter, ConductorRole, ConductorServer, Quota, SimCluster, StatsScope,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Top-level arguments.
#[derive(Parser, Debug)]
#[command(name = "s5mgr")]
#[command(about = "S5 cluster management CLI", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Conductor address (ip or ip:port); repeat or separate with commas
    #[arg(long = "conductor", global = true, value_delimiter = ',')]
    pub conductors: Vec<String>,

    /// Account to log in as
    #[arg(short, long, env = "S5_USER", default_value = "admin", global = true)]
    pub user: String,

    /// Password of the login account
    #[arg(short, long, env = "S5_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    /// Deadline for every call, in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Operation to run
    #[command(subcommand)]
    pub command: Command,
}

/// Management operations.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Tenant accounts and quotas
    Tenant {
        /// Tenant operation
        #[command(subcommand)]
        cmd: TenantCmd,
    },
    /// Administrator accounts
    Admin {
        /// Administrator operation
        #[command(subcommand)]
        cmd: AdminCmd,
    },
    /// Volume metadata
    Volume {
        /// Volume operation
        #[command(subcommand)]
        cmd: VolumeCmd,
    },
    /// Store nodes
    Store {
        /// Store operation
        #[command(subcommand)]
        cmd: StoreCmd,
    },
    /// Conductor roles
    Conductor {
        /// Conductor operation
        #[command(subcommand)]
        cmd: ConductorCmd,
    },
    /// Hardware components of a store
    Hw {
        /// Store name
        store: String,
        /// Component kind
        #[arg(value_enum)]
        kind: HwKind,
    },
    /// Attached data-path clients
    Links {
        /// Only links of this tenant
        #[arg(long)]
        tenant: Option<String>,
        /// Only links of this volume (needs --tenant)
        #[arg(long, requires = "tenant")]
        volume: Option<String>,
        /// Only links served by this store
        #[arg(long, conflicts_with = "tenant")]
        store: Option<String>,
    },
    /// Occupied bytes of a tenant or one of its volumes
    Occupied {
        /// Tenant name
        tenant: String,
        /// Volume of the tenant
        #[arg(long)]
        volume: Option<String>,
    },
    /// Realtime statistics of a store, tenant or volume
    Stats {
        /// Store name
        #[arg(long, conflicts_with = "tenant")]
        store: Option<String>,
        /// Tenant name
        #[arg(long)]
        tenant: Option<String>,
        /// Volume of the tenant (needs --tenant)
        #[arg(long, requires = "tenant")]
        volume: Option<String>,
    },
    /// Aggregate cluster capacity
    Capacity,
    /// Power off a store node
    PowerOff {
        /// Store name
        store: String,
    },
    /// Set fan speed rate, percentage times 100
    FanSpeed {
        /// Store name
        store: String,
        /// Rate, 0..=10000
        rate: u32,
    },
    /// Serve a simulated conductor cluster
    Sim {
        /// Listen address of one simulated conductor; repeat for more
        #[arg(long, required = true, value_delimiter = ',')]
        listen: Vec<String>,
    },
}

/// Tenant operations.
#[derive(Subcommand, Debug)]
pub enum TenantCmd {
    /// Create a tenant
    Create {
        /// Tenant name
        name: String,
        /// Password of the new tenant
        #[arg(long)]
        tenant_password: String,
        /// Capacity quota in bytes
        #[arg(long, allow_negative_numbers = true)]
        size: i64,
        /// IOPS quota
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        iops: i64,
        /// Bandwidth quota in bytes per second
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        bw: i64,
    },
    /// Delete a tenant without volumes
    Delete {
        /// Tenant name
        name: String,
    },
    /// Update a tenant; a negative quota value leaves it unchanged
    Update {
        /// Tenant name
        name: String,
        /// Rename to
        #[arg(long)]
        new_name: Option<String>,
        /// New password
        #[arg(long)]
        new_password: Option<String>,
        /// Capacity quota in bytes
        #[arg(long, default_value_t = UNCHANGED, allow_negative_numbers = true)]
        size: i64,
        /// IOPS quota
        #[arg(long, default_value_t = UNCHANGED, allow_negative_numbers = true)]
        iops: i64,
        /// Bandwidth quota in bytes per second
        #[arg(long, default_value_t = UNCHANGED, allow_negative_numbers = true)]
        bw: i64,
    },
    /// Show one tenant
    Stat {
        /// Tenant name
        name: String,
    },
    /// List all tenants
    List,
}

/// Administrator operations.
#[derive(Subcommand, Debug)]
pub enum AdminCmd {
    /// Create an administrator
    Create {
        /// Account name
        name: String,
        /// Password of the new administrator
        #[arg(long)]
        admin_password: String,
    },
    /// Delete an administrator
    Delete {
        /// Account name
        name: String,
    },
}

/// Volume operations.
#[derive(Subcommand, Debug)]
pub enum VolumeCmd {
    /// Create a volume
    Create {
        /// Owning tenant
        tenant: String,
        /// Volume name
        name: String,
        /// Size in bytes
        #[arg(long)]
        size: u64,
        /// IOPS limit
        #[arg(long, default_value_t = 0)]
        iops: u64,
        /// Bandwidth limit in bytes per second
        #[arg(long, default_value_t = 0)]
        bw: u64,
        /// Store holding a replica; repeat up to three times
        #[arg(long = "replica")]
        replicas: Vec<String>,
    },
    /// Delete a volume
    Delete {
        /// Owning tenant
        tenant: String,
        /// Volume name
        name: String,
    },
    /// Show one volume
    Stat {
        /// Owning tenant
        tenant: String,
        /// Volume name
        name: String,
    },
    /// Change the size of a volume
    Resize {
        /// Owning tenant
        tenant: String,
        /// Volume name
        name: String,
        /// New size in bytes
        #[arg(long)]
        size: u64,
    },
    /// List volumes
    List {
        /// Only volumes of this tenant
        #[arg(long)]
        tenant: Option<String>,
    },
}

/// Store operations.
#[derive(Subcommand, Debug)]
pub enum StoreCmd {
    /// Register a store node
    Add {
        /// Store name
        name: String,
        /// First daemon address
        address_a: String,
        /// Second daemon address
        address_b: String,
    },
    /// Remove a store node with no links or replicas
    Remove {
        /// Store name
        name: String,
    },
    /// List store nodes
    List,
    /// Show one store node
    Stat {
        /// Store name
        name: String,
    },
}

/// Conductor operations.
#[derive(Subcommand, Debug)]
pub enum ConductorCmd {
    /// Show the role of one conductor
    Stat {
        /// Conductor IP
        ip: String,
    },
    /// Show the roles of all configured conductors
    List,
    /// Change the role of a conductor
    SetRole {
        /// Conductor IP
        ip: String,
        /// Target role
        #[arg(value_enum)]
        role: RoleArg,
    },
}

/// Roles a conductor can be switched to.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleArg {
    /// Serve mutations
    Leader,
    /// Replicate from the leader
    Follower,
}

impl From<RoleArg> for ConductorRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Leader => ConductorRole::Leader,
            RoleArg::Follower => ConductorRole::Follower,
        }
    }
}

/// Hardware component listings.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwKind {
    /// Fans
    Fans,
    /// Power supplies
    Powers,
    /// Disk trays
    Trays,
    /// BCC modules
    Bccs,
    /// RGE modules
    Rges,
    /// Host ports
    HostPorts,
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl Cli {
    /// Runs the selected command and prints its result.
    pub async fn run(self) -> Result<()> {
        if let Command::Sim { ref listen } = self.command {
            return serve_sim(listen).await;
        }

        let mut config = match &self.config {
            Some(path) => MgmtConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => MgmtConfig::default(),
        };
        if !self.conductors.is_empty() {
            config.conductors = self.conductors.clone();
        }
        let password = self
            .password
            .clone()
            .context("password required (--password or S5_PASSWORD)")?;

        let manager = Manager::tcp(config);
        let mut ctx = manager.login(&self.user, &password, &[]).await?;
        if let Some(ms) = self.timeout_ms {
            ctx = ctx.with_timeout(Duration::from_millis(ms));
        }

        match self.command {
            Command::Tenant { cmd } => tenant(&manager, &ctx, cmd).await,
            Command::Admin { cmd } => admin(&manager, &ctx, cmd).await,
            Command::Volume { cmd } => volume(&manager, &ctx, cmd).await,
            Command::Store { cmd } => store(&manager, &ctx, cmd).await,
            Command::Conductor { cmd } => conductor(&manager, &ctx, cmd).await,
            Command::Hw { store, kind } => hardware(&manager, &ctx, &store, kind).await,
            Command::Links {
                tenant,
                volume,
                store,
            } => {
                let filter = match (tenant, volume, store) {
                    (Some(tenant), Some(volume), _) => ClientLinkFilter::Volume { tenant, volume },
                    (Some(tenant), None, _) => ClientLinkFilter::Tenant(tenant),
                    (None, _, Some(store)) => ClientLinkFilter::Store(store),
                    (None, _, None) => ClientLinkFilter::All,
                };
                print(&manager.telemetry().list_client_links(&ctx, filter).await?)
            }
            Command::Occupied { tenant, volume } => {
                let size = manager
                    .ledger()
                    .get_occupied_size(&ctx, &tenant, volume.as_deref())
                    .await?;
                print(&size)
            }
            Command::Stats {
                store,
                tenant,
                volume,
            } => {
                let scope = match (store, tenant, volume) {
                    (Some(store), _, _) => StatsScope::Store(store),
                    (None, Some(tenant), Some(volume)) => StatsScope::Volume { tenant, volume },
                    (None, Some(tenant), None) => StatsScope::Tenant(tenant),
                    (None, None, _) => anyhow::bail!("one of --store or --tenant is required"),
                };
                print(&manager.ledger().get_realtime_statistics(&ctx, &scope).await?)
            }
            Command::Capacity => print(&manager.controller().cluster_capacity(&ctx).await?),
            Command::PowerOff { store } => {
                manager.controller().power_off(&ctx, &store).await?;
                println!("power off of {store} accepted");
                Ok(())
            }
            Command::FanSpeed { store, rate } => {
                let speed = manager.controller().set_fan_speed(&ctx, &store, rate).await?;
                println!("{store}: fan speed {speed} rpm");
                Ok(())
            }
            Command::Sim { .. } => Ok(()),
        }
    }
}

async fn tenant(manager: &Manager, ctx: &ExecutionContext, cmd: TenantCmd) -> Result<()> {
    let ledger = manager.ledger();
    match cmd {
        TenantCmd::Create {
            name,
            tenant_password,
            size,
            iops,
            bw,
        } => {
            let quota = Quota::new(
                validate::quota_field("size", size)?,
                validate::quota_field("iops", iops)?,
                validate::quota_field("bw", bw)?,
            );
            print(&ledger.create_tenant(ctx, &name, &tenant_password, quota).await?)
        }
        TenantCmd::Delete { name } => {
            manager.controller().delete_tenant(ctx, &name).await?;
            println!("tenant {name} deleted");
            Ok(())
        }
        TenantCmd::Update {
            name,
            new_name,
            new_password,
            size,
            iops,
            bw,
        } => {
            let update = TenantUpdate {
                new_name,
                new_password,
                size,
                iops,
                bw,
            };
            print(&ledger.update_tenant(ctx, &name, update).await?)
        }
        TenantCmd::Stat { name } => print(&ledger.stat_tenant(ctx, &name).await?),
        TenantCmd::List => print(&ledger.list_tenants(ctx).await?),
    }
}

async fn admin(manager: &Manager, ctx: &ExecutionContext, cmd: AdminCmd) -> Result<()> {
    match cmd {
        AdminCmd::Create {
            name,
            admin_password,
        } => {
            manager
                .controller()
                .create_admin(ctx, &name, &admin_password)
                .await?;
            println!("admin {name} created");
        }
        AdminCmd::Delete { name } => {
            manager.controller().delete_admin(ctx, &name).await?;
            println!("admin {name} deleted");
        }
    }
    Ok(())
}

async fn volume(manager: &Manager, ctx: &ExecutionContext, cmd: VolumeCmd) -> Result<()> {
    let ledger = manager.ledger();
    match cmd {
        VolumeCmd::Create {
            tenant,
            name,
            size,
            iops,
            bw,
            replicas,
        } => {
            let spec = VolumeSpec {
                size,
                iops,
                bandwidth: bw,
                replicas,
            };
            print(&ledger.create_volume(ctx, &tenant, &name, spec).await?)
        }
        VolumeCmd::Delete { tenant, name } => {
            ledger.delete_volume(ctx, &tenant, &name).await?;
            println!("volume {tenant}/{name} deleted");
            Ok(())
        }
        VolumeCmd::Stat { tenant, name } => print(&ledger.stat_volume(ctx, &tenant, &name).await?),
        VolumeCmd::Resize { tenant, name, size } => {
            print(&ledger.resize_volume(ctx, &tenant, &name, size).await?)
        }
        VolumeCmd::List { tenant } => print(&ledger.list_volumes(ctx, tenant.as_deref()).await?),
    }
}

async fn store(manager: &Manager, ctx: &ExecutionContext, cmd: StoreCmd) -> Result<()> {
    match cmd {
        StoreCmd::Add {
            name,
            address_a,
            address_b,
        } => {
            manager
                .controller()
                .add_store(ctx, &name, &address_a, &address_b)
                .await?;
            println!("store {name} added");
            Ok(())
        }
        StoreCmd::Remove { name } => {
            manager.controller().delete_store(ctx, &name).await?;
            println!("store {name} removed");
            Ok(())
        }
        StoreCmd::List => print(&manager.topology().list_stores(ctx).await?),
        StoreCmd::Stat { name } => print(&manager.topology().stat_store(ctx, &name).await?),
    }
}

async fn conductor(manager: &Manager, ctx: &ExecutionContext, cmd: ConductorCmd) -> Result<()> {
    let topology = manager.topology();
    match cmd {
        ConductorCmd::Stat { ip } => print(&topology.stat_conductor(ctx, &ip).await?),
        ConductorCmd::List => print(&topology.list_conductors(ctx).await?),
        ConductorCmd::SetRole { ip, role } => {
            if role == RoleArg::Leader {
                topology.list_conductors(ctx).await?;
            }
            manager
                .controller()
                .set_conductor_role(ctx, &ip, role.into())
                .await?;
            println!("conductor {ip} is now {}", ConductorRole::from(role));
            Ok(())
        }
    }
}

async fn hardware(manager: &Manager, ctx: &ExecutionContext, store: &str, kind: HwKind) -> Result<()> {
    let telemetry = manager.telemetry();
    match kind {
        HwKind::Fans => print(&telemetry.list_fans(ctx, store).await?),
        HwKind::Powers => print(&telemetry.list_powers(ctx, store).await?),
        HwKind::Trays => print(&telemetry.list_trays(ctx, store).await?),
        HwKind::Bccs => print(&telemetry.list_bccs(ctx, store).await?),
        HwKind::Rges => print(&telemetry.list_rges(ctx, store).await?),
        HwKind::HostPorts => print(&telemetry.list_host_ports(ctx, store).await?),
    }
}

async fn serve_sim(listen: &[String]) -> Result<()> {
    for addr in listen {
        validate::conductor_addr(addr)?;
    }
    let ids: Vec<&str> = listen.iter().map(String::as_str).collect();
    let cluster = SimCluster::new(&ids);
    let mut servers = Vec::new();
    for addr in listen {
        let server = ConductorServer::bind(addr, Arc::new(cluster.service(addr)))
            .await
            .with_context(|| format!("binding simulated conductor {addr}"))?;
        tracing::info!(addr = %server.local_addr(), "simulated conductor serving");
        servers.push(server);
    }
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down simulated conductors");
    for server in &servers {
        server.shutdown();
    }
    Ok(())
}
