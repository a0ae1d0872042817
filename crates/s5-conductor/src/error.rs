use thiserror::Error;

use crate::message::{ErrorKind, RemoteError};

/// Connection-level failures talking to a single conductor.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused to {addr}")]
    ConnectionRefused { addr: String },

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: u64, timeout_ms: u64 },

    #[error("reply for request {got} does not match request {expected}")]
    ReplyMismatch { expected: u64, got: u64 },

    #[error("not connected")]
    NotConnected,

    #[error("cannot allocate {size} bytes for frame payload")]
    OutOfMemory { size: usize },

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Outcome of a conductor client call that did not produce a response.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every candidate conductor failed at the transport level.
    #[error("no conductor reachable (tried {tried:?}): {last_error}")]
    Unreachable {
        /// Conductor addresses tried, in order.
        tried: Vec<String>,
        /// Description of the last transport failure.
        last_error: String,
        /// An earlier delivery may have been applied by a conductor.
        ambiguous: bool,
    },

    /// The call deadline expired before a definite answer.
    #[error("deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded {
        /// Time spent in the call.
        elapsed_ms: u64,
        /// An earlier delivery may have been applied by a conductor.
        ambiguous: bool,
    },

    /// A conductor answered with a deterministic rejection.
    #[error("{error}")]
    Rejected {
        /// Error reported by the conductor.
        error: RemoteError,
        /// An earlier delivery of the same request timed out after being sent.
        ambiguous: bool,
    },

    /// A reply could not be materialized locally.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The request could not be framed for any conductor.
    #[error("request cannot be encoded: {0}")]
    Encoding(String),
}

impl ClientError {
    /// Error kind surfaced at the management boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Unreachable { .. } => ErrorKind::Unreachable,
            ClientError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            ClientError::Rejected { error, .. } => error.kind,
            ClientError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            ClientError::Encoding(_) => ErrorKind::Internal,
        }
    }

    /// Whether an earlier delivery of the request may have been applied.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            ClientError::Unreachable { ambiguous, .. }
            | ClientError::DeadlineExceeded { ambiguous, .. }
            | ClientError::Rejected { ambiguous, .. } => *ambiguous,
            ClientError::OutOfMemory(_) | ClientError::Encoding(_) => false,
        }
    }
}
