//! CALLER-facing tunnel errors.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{ErrorCode, ProtocolError};
use crate::storage::StorageError;

/// Errors surfaced to the reading side of a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("store error: {0}")]
    Storage(#[from] StorageError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The LISTENER published an error object for the round.
    #[error("remote {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("no response for request {request_id} within {timeout:?}")]
    Timeout { request_id: String, timeout: Duration },

    #[error("tunnel closed")]
    Closed,
}

impl TunnelError {
    /// Error class as it would appear in an error object.
    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::Storage(_) => ErrorCode::StorageError,
            TunnelError::Protocol(_) => ErrorCode::InvalidRequest,
            TunnelError::Remote { code, .. } => *code,
            TunnelError::Timeout { .. } => ErrorCode::Timeout,
            TunnelError::Closed => ErrorCode::ConnectionError,
        }
    }
}
