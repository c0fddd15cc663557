//! Waits for a round's response or error object.
//!
//! # Responsibilities
//! - List the responses folder until `I.resp` or `I.error` shows up
//! - Take the object: download, then delete
//! - Give up after the response timeout
//!
//! # Design Decisions
//! - The response is checked before the error within one tick
//! - Only the driver that composed a round polls for it, so a request id
//!   has a single consumer and download-then-delete needs no atomic take
//! - The last sleep is clipped to the deadline; a timeout is reported
//!   between `response_timeout` and `response_timeout + poll_interval`
//! - Multi-round continuation lives in `round.rs`, not here

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{Instrument, Span};

use crate::caller::error::TunnelError;
use crate::config::ProtocolConfig;
use crate::protocol::types::decode;
use crate::protocol::{paths_match, ErrorCode, ErrorObject, PathScheme};
use crate::storage::{FileInfo, SharedStore, StorageError};

/// How a poll ended.
#[derive(Debug)]
pub enum PollOutcome {
    Response(Bytes),
    Remote(ErrorObject),
    TimedOut,
}

#[derive(Clone)]
pub struct ResponsePoller {
    store: SharedStore,
    paths: PathScheme,
    poll_interval: Duration,
    response_timeout: Duration,
    span: Span,
}

impl ResponsePoller {
    pub fn new(store: SharedStore, config: &ProtocolConfig, span: Span) -> Self {
        Self {
            store,
            paths: PathScheme::from_config(config),
            poll_interval: config.poll_interval(),
            response_timeout: config.response_timeout(),
            span,
        }
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Poll until `request_id` completes or times out.
    ///
    /// Store failures that cannot succeed on a later tick (auth, bad path)
    /// end the poll with an error; anything else is logged and retried on
    /// the next tick.
    pub async fn poll(&self, request_id: &str) -> Result<PollOutcome, TunnelError> {
        let deadline = Instant::now() + self.response_timeout;
        async {
            loop {
                match self.check_once(request_id).await {
                    Ok(Some(outcome)) => return Ok(outcome),
                    Ok(None) => {}
                    Err(e @ (StorageError::Unauthorized(_) | StorageError::InvalidPath(_))) => {
                        return Err(e.into());
                    }
                    Err(e) => tracing::warn!(request_id, error = %e, "Response poll failed; retrying"),
                }

                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!(request_id, timeout = ?self.response_timeout, "No response before deadline");
                    return Ok(PollOutcome::TimedOut);
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// One listing pass. `Ok(None)` means nothing is there yet.
    async fn check_once(&self, request_id: &str) -> Result<Option<PollOutcome>, StorageError> {
        let files = self.store.list_files(self.paths.responses_folder()).await?;

        let response_path = self.paths.response(request_id);
        if contains(&files, &response_path) {
            if let Some(bytes) = self.take(&response_path).await? {
                tracing::debug!(request_id, bytes = bytes.len(), "Response received");
                return Ok(Some(PollOutcome::Response(bytes)));
            }
        }

        let error_path = self.paths.error(request_id);
        if contains(&files, &error_path) {
            if let Some(body) = self.take(&error_path).await? {
                let error = decode::<ErrorObject>(&body, "error object").unwrap_or_else(|e| {
                    ErrorObject::new(request_id, ErrorCode::ConnectionError, e.to_string())
                });
                tracing::debug!(request_id, code = %error.code, error = %error.error, "Error object received");
                return Ok(Some(PollOutcome::Remote(error)));
            }
        }

        Ok(None)
    }

    /// Download then delete. `None` if the listing was ahead of the object.
    async fn take(&self, path: &str) -> Result<Option<Bytes>, StorageError> {
        let bytes = match self.store.download_file(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if let Err(e) = self.store.delete_file(path).await {
            tracing::warn!(path, error = %e, "Failed to delete consumed object");
        }
        Ok(Some(bytes))
    }
}

fn contains(files: &[FileInfo], expected: &str) -> bool {
    let name = expected.rsplit('/').next().unwrap_or(expected);
    files.iter().any(|f| paths_match(&f.path, expected) || f.name == name)
}
