//! Error type of the management plane.

use s5_conductor::{ClientError, ErrorKind, RemoteError};
use thiserror::Error;

/// Failure surfaced by every management operation.
#[derive(Debug, Clone, Error)]
pub enum MgmtError {
    /// Malformed name, address, password or value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller lacks the required scope, or the login failed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No conductor answered.
    #[error("no conductor reachable: {0}")]
    Unreachable(String),

    /// The named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The name is taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The object is still in use.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The change contradicts observed cluster state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A result could not be allocated.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The call deadline passed.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Unexpected reply or other internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for management operations.
pub type Result<T> = std::result::Result<T, MgmtError>;

impl MgmtError {
    /// Builds an error of the given kind.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::InvalidArgument => MgmtError::InvalidArgument(detail),
            ErrorKind::PermissionDenied => MgmtError::PermissionDenied(detail),
            ErrorKind::Unreachable => MgmtError::Unreachable(detail),
            ErrorKind::NotFound => MgmtError::NotFound(detail),
            ErrorKind::AlreadyExists => MgmtError::AlreadyExists(detail),
            ErrorKind::PreconditionFailed => MgmtError::PreconditionFailed(detail),
            ErrorKind::Conflict => MgmtError::Conflict(detail),
            ErrorKind::OutOfMemory => MgmtError::OutOfMemory(detail),
            ErrorKind::DeadlineExceeded => MgmtError::DeadlineExceeded(detail),
            ErrorKind::Internal => MgmtError::Internal(detail),
        }
    }

    /// Kind of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MgmtError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MgmtError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            MgmtError::Unreachable(_) => ErrorKind::Unreachable,
            MgmtError::NotFound(_) => ErrorKind::NotFound,
            MgmtError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            MgmtError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            MgmtError::Conflict(_) => ErrorKind::Conflict,
            MgmtError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            MgmtError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            MgmtError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Human-readable detail without the kind prefix.
    pub fn detail(&self) -> &str {
        match self {
            MgmtError::InvalidArgument(d)
            | MgmtError::PermissionDenied(d)
            | MgmtError::Unreachable(d)
            | MgmtError::NotFound(d)
            | MgmtError::AlreadyExists(d)
            | MgmtError::PreconditionFailed(d)
            | MgmtError::Conflict(d)
            | MgmtError::OutOfMemory(d)
            | MgmtError::DeadlineExceeded(d)
            | MgmtError::Internal(d) => d,
        }
    }
}

impl From<RemoteError> for MgmtError {
    fn from(e: RemoteError) -> Self {
        MgmtError::new(e.kind, e.detail)
    }
}

impl From<ClientError> for MgmtError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Rejected { error, .. } => error.into(),
            other => MgmtError::new(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_new() {
        for kind in [
            ErrorKind::InvalidArgument,
            ErrorKind::PermissionDenied,
            ErrorKind::Unreachable,
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::PreconditionFailed,
            ErrorKind::Conflict,
            ErrorKind::OutOfMemory,
            ErrorKind::DeadlineExceeded,
            ErrorKind::Internal,
        ] {
            let err = MgmtError::new(kind, "detail");
            assert_eq!(err.kind(), kind);
            assert_eq!(err.detail(), "detail");
        }
    }

    #[test]
    fn test_rejection_keeps_remote_detail() {
        let err: MgmtError = ClientError::Rejected {
            error: RemoteError::new(ErrorKind::NotFound, "tenant acme not found"),
            ambiguous: false,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "not found: tenant acme not found");
    }

    #[test]
    fn test_unreachable_mapping() {
        let err: MgmtError = ClientError::Unreachable {
            tried: vec!["10.0.0.1".to_string()],
            last_error: "connection refused to 10.0.0.1".to_string(),
            ambiguous: false,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert!(err.detail().contains("10.0.0.1"));
    }
}
