//! Wire types and the error taxonomy.

use std::fmt;
use std::io;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::storage::types::unix_millis;

/// Milliseconds since the Unix epoch, as written into protocol objects.
pub fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}

/// Errors raised while encoding or interpreting protocol objects.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed {what}: {source}")]
    Malformed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

/// A validated GOAL endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub address: String,
    pub port: u16,
}

impl Target {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self { address: address.into(), port }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Per-round request metadata (`R/I.req`). Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub request_id: String,
    pub target_address: String,
    /// Kept wider than `u16` so out-of-range ports are rejected by
    /// validation rather than by the parser.
    pub target_port: u32,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_first_in_session: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_session_alive: Option<bool>,
}

impl RequestMetadata {
    /// Metadata for a one-shot round.
    pub fn new(request_id: impl Into<String>, target: &Target) -> Self {
        Self {
            request_id: request_id.into(),
            target_address: target.address.clone(),
            target_port: u32::from(target.port),
            timestamp: now_millis(),
            session_id: None,
            is_first_in_session: None,
            keep_session_alive: None,
        }
    }

    /// Attach session fields; session rounds always ask the LISTENER to keep the socket.
    pub fn with_session(mut self, session_id: impl Into<String>, is_first: bool) -> Self {
        self.session_id = Some(session_id.into());
        self.is_first_in_session = Some(is_first);
        self.keep_session_alive = Some(true);
        self
    }

    /// Session id, if present and non-empty.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|id| !id.trim().is_empty())
    }

    pub fn is_first_in_session(&self) -> bool {
        self.is_first_in_session.unwrap_or(false)
    }

    pub fn keeps_session_alive(&self) -> bool {
        self.keep_session_alive.unwrap_or(false)
    }

    /// Check the target fields.
    pub fn validate(&self) -> Result<Target, ProtocolError> {
        let address = self.target_address.trim();
        if address.is_empty() {
            return Err(ProtocolError::InvalidTarget("empty target address".to_string()));
        }
        if !(1..=65535).contains(&self.target_port) {
            return Err(ProtocolError::InvalidTarget(format!(
                "target port {} out of range",
                self.target_port
            )));
        }
        Ok(Target::new(address, self.target_port as u16))
    }
}

/// Readiness marker (`R/I.ready`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyMarker {
    pub total_chunks: u32,
    pub total_bytes: u64,
}

/// Failure classes reported through error objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionError,
    Timeout,
    InvalidRequest,
    StorageError,
}

impl ErrorCode {
    /// Classify a connection-layer failure by its message.
    pub fn classify(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        if message.contains("timeout") || message.contains("timed out") {
            ErrorCode::Timeout
        } else {
            // "refused", "reset" and anything unrecognised.
            ErrorCode::ConnectionError
        }
    }

    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ErrorCode::Timeout,
            _ => Self::classify(&err.to_string()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionError => "CONNECTION_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::StorageError => "STORAGE_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error object (`P/I.error`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorObject {
    pub request_id: String,
    pub error: String,
    pub code: ErrorCode,
    pub timestamp: u64,
}

impl ErrorObject {
    pub fn new(request_id: impl Into<String>, code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            error: error.into(),
            code,
            timestamp: now_millis(),
        }
    }
}

/// Serialize a protocol object to its JSON body.
pub fn encode<T: Serialize>(value: &T, what: &'static str) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| ProtocolError::Malformed { what, source })
}

/// Parse a protocol object from its JSON body.
pub fn decode<T: DeserializeOwned>(bytes: &[u8], what: &'static str) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|source| ProtocolError::Malformed { what, source })
}
