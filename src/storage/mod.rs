//! Object store subsystem.
//!
//! # Data Flow
//! ```text
//! protocol / caller / listener
//!     → ObjectStore trait (list / download / upload / delete)
//!         → memory.rs (in-process map)
//!         → fs.rs (shared directory, atomic rename)
//!         → http.rs (REST endpoint, retries via resilience)
//! ```
//!
//! # Design Decisions
//! - The trait is the whole contract; protocol code never sees HTTP
//! - Uploads create or overwrite; deletes are idempotent
//! - Downloads of absent objects fail with `StorageError::NotFound`

pub mod fs;
pub mod http;
pub mod memory;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{RetryConfig, StorageConfig};
use crate::resilience::retries::RetryPolicy;

pub use fs::FsStore;
pub use http::HttpStore;
pub use memory::MemoryStore;
pub use types::{FileInfo, StorageError, StorageResult};

/// A flat, eventually-consistent blob store addressed by `folder/name` paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List the objects directly inside `folder`.
    async fn list_files(&self, folder: &str) -> StorageResult<Vec<FileInfo>>;

    /// Fetch an object's bytes. Fails with `NotFound` if absent.
    async fn download_file(&self, path: &str) -> StorageResult<Bytes>;

    /// Create or overwrite an object.
    async fn upload_file(&self, path: &str, data: Bytes) -> StorageResult<()>;

    /// Remove an object. Removing an absent object succeeds.
    async fn delete_file(&self, path: &str) -> StorageResult<()>;
}

/// Shared handle used by every component.
pub type SharedStore = Arc<dyn ObjectStore>;

/// Build the configured store backend.
pub async fn build_store(config: &StorageConfig, retries: &RetryConfig) -> StorageResult<SharedStore> {
    let store: SharedStore = match config {
        StorageConfig::Memory => Arc::new(MemoryStore::new()),
        StorageConfig::Filesystem { root } => Arc::new(FsStore::open(root).await?),
        StorageConfig::Http { base_url, token, request_timeout_secs } => Arc::new(HttpStore::new(
            base_url,
            token.clone(),
            Duration::from_secs(*request_timeout_secs),
            RetryPolicy::from(retries),
        )?),
    };
    Ok(store)
}
