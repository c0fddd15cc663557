//! In-process object store.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::storage::types::{unix_millis, FileInfo, StorageError, StorageResult};
use crate::storage::ObjectStore;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    modified_at: u64,
}

/// A concurrent map standing in for a remote store.
///
/// Cloning shares the underlying map, so a CALLER and a LISTENER running in
/// one process see the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<DashMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an object exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.objects.contains_key(key(path))
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.iter().map(|r| r.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

fn key(path: &str) -> &str {
    path.trim_start_matches('/')
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_files(&self, folder: &str) -> StorageResult<Vec<FileInfo>> {
        let prefix = format!("{}/", key(folder).trim_end_matches('/'));
        let mut files: Vec<FileInfo> = self
            .objects
            .iter()
            .filter_map(|entry| {
                let name = entry.key().strip_prefix(&prefix)?;
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                Some(FileInfo {
                    name: name.to_string(),
                    path: entry.key().clone(),
                    size: entry.value().data.len() as u64,
                    modified_at: entry.value().modified_at,
                })
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn download_file(&self, path: &str) -> StorageResult<Bytes> {
        self.objects
            .get(key(path))
            .map(|entry| entry.data.clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn upload_file(&self, path: &str, data: Bytes) -> StorageResult<()> {
        self.objects.insert(
            key(path).to_string(),
            StoredObject {
                data,
                modified_at: unix_millis(SystemTime::now()),
            },
        );
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> StorageResult<()> {
        self.objects.remove(key(path));
        Ok(())
    }
}
