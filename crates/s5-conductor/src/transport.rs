//! Abstract connection layer between the conductor client and conductors.
//!
//! The client only depends on [`ConductorTransport`]; the TCP backend and the in-memory
//! simulator both implement it.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{Envelope, Reply};
use crate::tcp::{dial, FramedStream, TcpOptions};

/// Opens connections to conductors.
#[async_trait]
pub trait ConductorTransport: Send + Sync + 'static {
    /// Connect to the conductor at `addr`.
    async fn connect(&self, addr: &str) -> Result<Box<dyn ConductorConnection>>;
}

/// An established connection to one conductor.
///
/// A connection carries one request at a time: `send` followed by `recv`.
#[async_trait]
pub trait ConductorConnection: Send + Sync {
    /// Send a request.
    async fn send(&mut self, envelope: &Envelope) -> Result<()>;

    /// Receive the reply to the last request sent.
    async fn recv(&mut self) -> Result<Reply>;

    /// Address of the remote conductor.
    fn peer_addr(&self) -> &str;
}

/// TCP transport to real conductors.
#[derive(Debug, Clone, Default)]
pub struct TcpConductorTransport {
    options: TcpOptions,
}

impl TcpConductorTransport {
    /// Creates a TCP transport with the given socket options.
    pub fn with_options(options: TcpOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ConductorTransport for TcpConductorTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn ConductorConnection>> {
        Ok(Box::new(dial(addr, &self.options).await?))
    }
}

#[async_trait]
impl ConductorConnection for FramedStream {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.send_request(envelope).await
    }

    async fn recv(&mut self) -> Result<Reply> {
        self.recv_reply().await
    }

    fn peer_addr(&self) -> &str {
        self.peer()
    }
}
