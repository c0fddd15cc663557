//! Shared-directory object store.
//!
//! # Responsibilities
//! - Map object paths onto files under a root directory
//! - Publish objects atomically (write temp file, then rename)
//! - Hide in-progress temp files from listings
//!
//! # Design Decisions
//! - Intended for folders replicated by an external sync client, which is
//!   what makes the store eventually consistent
//! - Paths containing `..` or absolute components are rejected

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use crate::storage::types::{unix_millis, FileInfo, StorageError, StorageResult};
use crate::storage::ObjectStore;

const TEMP_PREFIX: char = '.';

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        tracing::info!(root = %root.display(), "Filesystem store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn map_not_found(err: std::io::Error, path: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn list_files(&self, folder: &str) -> StorageResult<Vec<FileInfo>> {
        let dir = self.resolve(folder)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let folder = folder.trim_matches('/');
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            // Raced with a delete or rename; skip rather than fail the listing.
            let Ok(meta) = entry.metadata().await else { continue };
            if !meta.is_file() {
                continue;
            }
            files.push(FileInfo {
                path: format!("{}/{}", folder, name),
                name,
                size: meta.len(),
                modified_at: meta.modified().map(unix_millis).unwrap_or_default(),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn download_file(&self, path: &str) -> StorageResult<Bytes> {
        let file = self.resolve(path)?;
        fs::read(&file)
            .await
            .map(Bytes::from)
            .map_err(|e| map_not_found(e, path))
    }

    async fn upload_file(&self, path: &str, data: Bytes) -> StorageResult<()> {
        let file = self.resolve(path)?;
        let (Some(parent), Some(name)) = (file.parent(), file.file_name()) else {
            return Err(StorageError::InvalidPath(path.to_string()));
        };
        fs::create_dir_all(parent).await?;

        let temp = parent.join(format!(
            "{}{}.{}.tmp",
            TEMP_PREFIX,
            name.to_string_lossy(),
            uuid::Uuid::new_v4().simple()
        ));
        fs::write(&temp, &data).await?;
        if let Err(e) = fs::rename(&temp, &file).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> StorageResult<()> {
        let file = self.resolve(path)?;
        match fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();

        store.upload_file("requests/a.req", Bytes::from_static(b"{}")).await.unwrap();
        store.upload_file("requests/a.chunk.0", Bytes::from_static(b"hello")).await.unwrap();

        let listed = store.list_files("requests").await.unwrap();
        let names: Vec<&str> = listed.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.chunk.0", "a.req"]);
        assert_eq!(listed[0].path, "requests/a.chunk.0");
        assert_eq!(listed[0].size, 5);

        assert_eq!(store.download_file("requests/a.chunk.0").await.unwrap(), "hello");

        store.delete_file("requests/a.chunk.0").await.unwrap();
        store.delete_file("requests/a.chunk.0").await.unwrap();
        assert!(store.download_file("requests/a.chunk.0").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn hides_temp_files_and_missing_folders() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();

        assert!(store.list_files("responses").await.unwrap().is_empty());

        std::fs::create_dir_all(dir.path().join("responses")).unwrap();
        std::fs::write(dir.path().join("responses/.x.resp.abc.tmp"), b"partial").unwrap();
        assert!(store.list_files("responses").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();

        let err = store.upload_file("../outside", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }
}
