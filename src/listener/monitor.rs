//! Discovers new rounds by polling the requests folder.
//!
//! # Responsibilities
//! - Seed the known set from whatever is present at startup
//! - Emit each newly listed metadata object exactly once
//! - Survive listing failures
//!
//! # Design Decisions
//! - Known entries are canonical metadata paths built from the parsed
//!   request id, so store path formatting cannot cause re-discovery
//! - The monitor only adds to the known set; the processor forgets an
//!   entry after cleaning up its round

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{broadcast, mpsc};
use tracing::{Instrument, Span};

use crate::config::ProtocolConfig;
use crate::protocol::paths::{classify_object, ObjectKind};
use crate::protocol::PathScheme;
use crate::storage::{SharedStore, StorageResult};

/// Metadata objects already handed out (or present at startup).
#[derive(Debug, Clone, Default)]
pub struct KnownRequests {
    inner: Arc<DashSet<String>>,
}

impl KnownRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path`; `false` if it was already known.
    pub fn insert(&self, path: String) -> bool {
        self.inner.insert(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.contains(path)
    }

    pub fn forget(&self, path: &str) {
        self.inner.remove(path);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub struct RequestMonitor {
    store: SharedStore,
    paths: PathScheme,
    poll_interval: Duration,
    known: KnownRequests,
    span: Span,
}

impl RequestMonitor {
    pub fn new(store: SharedStore, config: &ProtocolConfig, known: KnownRequests, span: Span) -> Self {
        Self {
            store,
            paths: PathScheme::from_config(config),
            poll_interval: config.poll_interval(),
            known,
            span,
        }
    }

    pub fn known(&self) -> &KnownRequests {
        &self.known
    }

    /// Mark everything currently listed as handled.
    pub async fn seed(&self) -> StorageResult<usize> {
        let ids = self.list_request_ids().await?;
        let count = ids.len();
        for id in ids {
            self.known.insert(self.paths.request_metadata(&id));
        }
        Ok(count)
    }

    /// One listing pass; returns ids not seen before, in listing order.
    pub async fn poll_once(&self) -> StorageResult<Vec<String>> {
        let ids = self.list_request_ids().await?;
        Ok(ids
            .into_iter()
            .filter(|id| self.known.insert(self.paths.request_metadata(id)))
            .collect())
    }

    async fn list_request_ids(&self) -> StorageResult<Vec<String>> {
        let files = self.store.list_files(self.paths.requests_folder()).await?;
        Ok(files
            .iter()
            .filter_map(|f| match classify_object(&f.name) {
                Some((id, ObjectKind::Metadata)) => Some(id),
                _ => None,
            })
            .collect())
    }

    /// Poll until shutdown, sending each new request id on `discovered`.
    pub async fn run(self, discovered: mpsc::Sender<String>, mut shutdown: broadcast::Receiver<()>) {
        let span = self.span.clone();
        async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut seeded = false;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => break,
                }

                if !seeded {
                    match self.seed().await {
                        Ok(count) => {
                            tracing::info!(existing = count, "Request monitor started");
                            seeded = true;
                        }
                        Err(e) => tracing::warn!(error = %e, "Initial listing failed; retrying"),
                    }
                    continue;
                }

                match self.poll_once().await {
                    Ok(ids) => {
                        for id in ids {
                            tracing::debug!(request_id = %id, "Discovered request");
                            if discovered.send(id).await.is_err() {
                                tracing::debug!("Discovery receiver dropped");
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Request listing failed"),
                }
            }
            tracing::info!("Request monitor stopped");
        }
        .instrument(span)
        .await
    }
}
