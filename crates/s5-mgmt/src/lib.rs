#![warn(missing_docs)]

//! S5 management control plane: topology store, quota ledger, cluster controller and
//! telemetry aggregator on top of the conductor failover client.

pub mod cli;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
mod listing;
pub mod manager;
pub mod quota;
pub mod telemetry;
pub mod topology;
pub mod validate;

#[cfg(test)]
mod testutil;

pub use config::MgmtConfig;
pub use context::{Capability, ExecutionContext, Scope};
pub use controller::{ClusterController, OccupancySnapshot};
pub use error::{MgmtError, Result};
pub use manager::Manager;
pub use quota::{QuotaLedger, TenantUpdate, VolumeSpec, UNCHANGED};
pub use telemetry::TelemetryAggregator;
pub use topology::{CachedStores, TopologyStore};
