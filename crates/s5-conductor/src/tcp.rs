//! Framed conductor messages over tokio TCP streams.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::message::{Envelope, Reply};
use crate::protocol::{
    alloc_payload, decode_reply, decode_request, encode_reply, encode_request, FrameHeader,
    FRAME_HEADER_SIZE,
};

/// Socket options for conductor connections.
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// Upper bound on the TCP handshake.
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm; control messages are small and latency bound.
    pub nodelay: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

/// Opens a connection to the conductor at `addr` (`ip:port`).
pub async fn dial(addr: &str, options: &TcpOptions) -> Result<FramedStream> {
    let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr)).await
    {
        Err(_) => {
            return Err(TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: options.connect_timeout.as_millis() as u64,
            })
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            return Err(TransportError::ConnectionRefused {
                addr: addr.to_string(),
            })
        }
        Ok(Err(e)) => return Err(TransportError::IoError(e)),
        Ok(Ok(stream)) => stream,
    };
    debug!(addr = addr, "dialed conductor");
    FramedStream::new(stream, options.nodelay)
}

/// One TCP stream carrying 20-byte-header frames in both directions.
///
/// The client side uses `send_request`/`recv_reply`, the server side
/// `recv_request`/`send_reply`.
pub struct FramedStream {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    peer: String,
}

impl FramedStream {
    /// Wraps an established stream.
    pub fn new(stream: TcpStream, nodelay: bool) -> Result<Self> {
        if nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            peer,
        })
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_all(frame).await.map_err(stream_error)?;
        self.writer.flush().await.map_err(stream_error)
    }

    async fn read_frame(&mut self) -> Result<(FrameHeader, Vec<u8>)> {
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        self.reader.read_exact(&mut raw).await.map_err(stream_error)?;
        let header = FrameHeader::decode(&raw)?;
        let mut payload = alloc_payload(header.payload_length as usize)?;
        if !payload.is_empty() {
            self.reader
                .read_exact(&mut payload)
                .await
                .map_err(stream_error)?;
        }
        Ok((header, payload))
    }

    /// Writes a request frame.
    pub async fn send_request(&mut self, envelope: &Envelope) -> Result<()> {
        let frame = encode_request(envelope)?;
        self.write_frame(&frame).await
    }

    /// Reads the next reply frame.
    pub async fn recv_reply(&mut self) -> Result<Reply> {
        let (header, payload) = self.read_frame().await?;
        decode_reply(&header, &payload)
    }

    /// Reads the next request; `None` once the client hung up.
    pub async fn recv_request(&mut self) -> Result<Option<Envelope>> {
        match self.read_frame().await {
            Ok((header, payload)) => decode_request(&header, &payload).map(Some),
            Err(TransportError::ConnectionReset) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes a reply frame.
    pub async fn send_reply(&mut self, reply: &Reply) -> Result<()> {
        let frame = encode_reply(reply)?;
        self.write_frame(&frame).await
    }

    /// Remote `ip:port`, empty if the socket could not report it.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// EOF and reset both mean the peer is gone.
fn stream_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
            TransportError::ConnectionReset
        }
        _ => TransportError::IoError(e),
    }
}
