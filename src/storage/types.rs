//! Object store types and error definitions.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::retries::{RetryHint, Retryable};

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Bare object name (`<id>.req`).
    pub name: String,
    /// Path as reported by the store; may carry store-specific prefixes.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification, milliseconds since the Unix epoch.
    pub modified_at: u64,
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Credentials rejected. Never retried.
    #[error("store rejected credentials (HTTP {0})")]
    Unauthorized(u16),

    /// Non-success HTTP status.
    #[error("store returned HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Connection-level failure talking to the store.
    #[error("store request failed: {0}")]
    Transport(String),

    /// Local filesystem failure.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Path escapes the store root or is otherwise unusable.
    #[error("invalid object path '{0}'")]
    InvalidPath(String),

    /// A retryable failure persisted past the retry budget.
    #[error("store call failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl Retryable for StorageError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            StorageError::Http { status, retry_after, .. } if *status == 429 || *status >= 500 => {
                match retry_after {
                    Some(delay) => RetryHint::RetryAfter(*delay),
                    None => RetryHint::Retry,
                }
            }
            StorageError::Transport(_) => RetryHint::Retry,
            _ => RetryHint::Fatal,
        }
    }
}

/// Result type for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Milliseconds since the Unix epoch.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
