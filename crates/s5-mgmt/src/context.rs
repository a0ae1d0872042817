//! Execution context: who is calling, which conductors to reach and what they may do.

use std::time::Duration;

use s5_conductor::{CallOutcome, ClientError, ConductorClient, ErrorKind, Executor, Request, Response};

use crate::error::{MgmtError, Result};

/// Scope established at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// Cluster-wide administrator.
    Admin,
    /// Tenant restricted to its own resources.
    Tenant(String),
}

/// What an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// Cluster-wide state: stores, conductors, admins, hardware.
    Cluster,
    /// Resources of one tenant.
    Tenant(&'a str),
}

/// Identity, conductor list and optional timeout shared by a sequence of calls.
///
/// Obtained from [`crate::Manager::login`]; cheap to clone.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    executor: Executor,
    conductors: Vec<String>,
    timeout: Option<Duration>,
    capability: Capability,
}

impl ExecutionContext {
    pub(crate) fn new(executor: Executor, conductors: Vec<String>, capability: Capability) -> Self {
        Self {
            executor,
            conductors,
            timeout: None,
            capability,
        }
    }

    /// Identity presented with every request.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Conductor addresses, in configured order.
    pub fn conductors(&self) -> &[String] {
        &self.conductors
    }

    /// Per-call timeout, if one was set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Capability established at login.
    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    /// Whether the executor is an administrator.
    pub fn is_admin(&self) -> bool {
        self.capability == Capability::Admin
    }

    /// Bounds every call made with this context by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the conductor list.
    pub fn with_conductors(mut self, conductors: Vec<String>) -> Self {
        self.conductors = conductors;
        self
    }

    /// Checks that the capability covers `scope`.
    pub fn authorize(&self, scope: Scope<'_>) -> Result<()> {
        match (&self.capability, scope) {
            (Capability::Admin, _) => Ok(()),
            (Capability::Tenant(own), Scope::Tenant(tenant)) if own == tenant => Ok(()),
            (Capability::Tenant(own), Scope::Tenant(tenant)) => Err(MgmtError::PermissionDenied(
                format!("tenant {own} may not access tenant {tenant}"),
            )),
            (Capability::Tenant(own), Scope::Cluster) => Err(MgmtError::PermissionDenied(format!(
                "tenant {own} lacks admin privileges"
            ))),
        }
    }

    pub(crate) async fn call(
        &self,
        client: &ConductorClient,
        request: Request,
    ) -> std::result::Result<CallOutcome, ClientError> {
        client
            .call(&self.conductors, &self.executor, request, self.timeout)
            .await
    }

    pub(crate) async fn send(&self, client: &ConductorClient, request: Request) -> Result<Response> {
        Ok(self.call(client, request).await?.response)
    }
}

/// The conductor rejected a re-delivered request with `kind`.
pub(crate) fn ambiguous_rejection(error: &ClientError, kind: ErrorKind) -> bool {
    matches!(error, ClientError::Rejected { error, ambiguous: true } if error.kind == kind)
}

pub(crate) fn unexpected(op: &str, response: Response) -> MgmtError {
    MgmtError::Internal(format!("unexpected response to {op}: {response:?}"))
}
