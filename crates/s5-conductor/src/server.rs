//! Conductor server: serves a [`ConductorService`] over framed TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::message::{Envelope, Reply};
use crate::tcp::FramedStream;

/// Answers conductor requests.
pub trait ConductorService: Send + Sync + 'static {
    /// Handles one request. `None` leaves the request unanswered.
    fn handle(&self, envelope: Envelope) -> Option<Reply>;
}

/// Running TCP server for one conductor service.
///
/// The accept loop stops when the server is shut down or dropped.
pub struct ConductorServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ConductorServer {
    /// Binds `addr` and starts serving `service` in the background.
    pub async fn bind(addr: &str, service: Arc<dyn ConductorService>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::IoError)?;
        let local_addr = listener.local_addr().map_err(TransportError::IoError)?;
        info!(addr = %local_addr, "conductor server listening");
        let task = tokio::spawn(async move {
            if let Err(e) = Self::serve(listener, service).await {
                warn!(error = %e, "conductor server stopped");
            }
        });
        Ok(Self { local_addr, task })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections.
    pub fn shutdown(&self) {
        self.task.abort();
    }

    /// Waits until the accept loop ends.
    pub async fn wait(mut self) {
        let _ = (&mut self.task).await;
    }

    /// Runs the accept loop, spawning a task per connection.
    pub async fn serve(listener: TcpListener, service: Arc<dyn ConductorService>) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await.map_err(TransportError::IoError)?;
            let mut conn = match FramedStream::new(stream, true) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "rejecting connection");
                    continue;
                }
            };
            let peer = conn.peer().to_string();
            debug!(peer = %peer, "accepted connection");
            let service = service.clone();
            tokio::spawn(async move {
                loop {
                    let envelope = match conn.recv_request().await {
                        Ok(Some(envelope)) => envelope,
                        Ok(None) => {
                            debug!(peer = %peer, "connection closed");
                            break;
                        }
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "dropping connection");
                            break;
                        }
                    };
                    let request_id = envelope.request_id;
                    match service.handle(envelope) {
                        Some(reply) => {
                            if let Err(e) = conn.send_reply(&reply).await {
                                warn!(peer = %peer, error = %e, "failed to send reply");
                                break;
                            }
                        }
                        None => debug!(peer = %peer, request_id, "request left unanswered"),
                    }
                }
            });
        }
    }
}

impl Drop for ConductorServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ConductorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConductorServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
