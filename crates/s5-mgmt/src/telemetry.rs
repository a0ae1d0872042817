//! Read-only hardware and client-link snapshots.

use std::sync::Arc;

use s5_conductor::{
    BccInfo, ClientLinkFilter, ClientLinkRecord, ConductorClient, FanInfo, HostPortInfo,
    PowerInfo, Request, Response, RgeInfo, TrayInfo,
};

use crate::context::{unexpected, ExecutionContext, Scope};
use crate::error::Result;
use crate::listing::materialize;
use crate::validate;

/// Admin-only listings of store hardware and attached clients.
pub struct TelemetryAggregator {
    client: Arc<ConductorClient>,
}

impl TelemetryAggregator {
    /// Creates an aggregator over `client`.
    pub fn new(client: Arc<ConductorClient>) -> Self {
        Self { client }
    }

    async fn store_listing(&self, ctx: &ExecutionContext, store: &str, request: Request) -> Result<Response> {
        ctx.authorize(Scope::Cluster)?;
        validate::name("store", store)?;
        ctx.send(&self.client, request).await
    }

    /// Fans of `store`.
    pub async fn list_fans(&self, ctx: &ExecutionContext, store: &str) -> Result<Vec<FanInfo>> {
        let request = Request::ListFans {
            store: store.to_string(),
        };
        match self.store_listing(ctx, store, request).await? {
            Response::Fans(fans) => materialize("fan", fans),
            other => Err(unexpected("list_fans", other)),
        }
    }

    /// Power supplies of `store`.
    pub async fn list_powers(&self, ctx: &ExecutionContext, store: &str) -> Result<Vec<PowerInfo>> {
        let request = Request::ListPowers {
            store: store.to_string(),
        };
        match self.store_listing(ctx, store, request).await? {
            Response::Powers(powers) => materialize("power supply", powers),
            other => Err(unexpected("list_powers", other)),
        }
    }

    /// Disk trays of `store` with their sets.
    pub async fn list_trays(&self, ctx: &ExecutionContext, store: &str) -> Result<Vec<TrayInfo>> {
        let request = Request::ListTrays {
            store: store.to_string(),
        };
        match self.store_listing(ctx, store, request).await? {
            Response::Trays(trays) => materialize("tray", trays),
            other => Err(unexpected("list_trays", other)),
        }
    }

    /// BCC modules of `store`.
    pub async fn list_bccs(&self, ctx: &ExecutionContext, store: &str) -> Result<Vec<BccInfo>> {
        let request = Request::ListBccs {
            store: store.to_string(),
        };
        match self.store_listing(ctx, store, request).await? {
            Response::Bccs(bccs) => materialize("bcc", bccs),
            other => Err(unexpected("list_bccs", other)),
        }
    }

    /// RGE modules of `store`.
    pub async fn list_rges(&self, ctx: &ExecutionContext, store: &str) -> Result<Vec<RgeInfo>> {
        let request = Request::ListRges {
            store: store.to_string(),
        };
        match self.store_listing(ctx, store, request).await? {
            Response::Rges(rges) => materialize("rge", rges),
            other => Err(unexpected("list_rges", other)),
        }
    }

    /// Host ports of `store`.
    pub async fn list_host_ports(
        &self,
        ctx: &ExecutionContext,
        store: &str,
    ) -> Result<Vec<HostPortInfo>> {
        let request = Request::ListHostPorts {
            store: store.to_string(),
        };
        match self.store_listing(ctx, store, request).await? {
            Response::HostPorts(ports) => materialize("host port", ports),
            other => Err(unexpected("list_host_ports", other)),
        }
    }

    /// Client links selected by `filter`.
    pub async fn list_client_links(
        &self,
        ctx: &ExecutionContext,
        filter: ClientLinkFilter,
    ) -> Result<Vec<ClientLinkRecord>> {
        ctx.authorize(Scope::Cluster)?;
        match &filter {
            ClientLinkFilter::All => {}
            ClientLinkFilter::Tenant(tenant) => validate::name("tenant", tenant)?,
            ClientLinkFilter::Volume { tenant, volume } => {
                validate::name("tenant", tenant)?;
                validate::name("volume", volume)?;
            }
            ClientLinkFilter::Store(store) => validate::name("store", store)?,
        }
        match ctx
            .send(&self.client, Request::ListClientLinks(filter))
            .await?
        {
            Response::ClientLinks(links) => materialize("client link", links),
            other => Err(unexpected("list_client_links", other)),
        }
    }
}
