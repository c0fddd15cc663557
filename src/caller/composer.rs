//! Turns one round's outbound bytes into store objects.
//!
//! # Responsibilities
//! - Write the metadata object when the round's first bytes arrive
//! - Write one chunk object per write, indices contiguous from 0
//! - Write the readiness marker right after the first chunk
//!
//! # Design Decisions
//! - The marker is written once and never rewritten. It describes the
//!   provisional `{1, N}` state after chunk 0, so polling can start before
//!   the client closes (TLS clients stop writing without closing)
//! - An empty round gets marker `{0, 0}` on finish; that marker is only
//!   ever written when no chunk exists
//! - Every upload is awaited before the next object is written, which
//!   gives chunk-before-marker ordering

use bytes::Bytes;

use crate::caller::error::TunnelError;
use crate::protocol::types::encode;
use crate::protocol::{PathScheme, ReadyMarker, RequestMetadata};
use crate::storage::SharedStore;

pub struct RequestComposer {
    store: SharedStore,
    paths: PathScheme,
    metadata: RequestMetadata,
    metadata_written: bool,
    next_chunk: u32,
    bytes_written: u64,
    marker_written: bool,
}

impl RequestComposer {
    pub fn new(store: SharedStore, paths: PathScheme, metadata: RequestMetadata) -> Self {
        Self {
            store,
            paths,
            metadata,
            metadata_written: false,
            next_chunk: 0,
            bytes_written: 0,
            marker_written: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.metadata.request_id
    }

    pub fn chunks_written(&self) -> u32 {
        self.next_chunk
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whether the round has been published (marker present).
    pub fn is_uploaded(&self) -> bool {
        self.marker_written
    }

    /// Append `data` as the next chunk.
    ///
    /// Returns `true` when this write published the round, i.e. the
    /// response poller may start.
    pub async fn write(&mut self, data: Bytes) -> Result<bool, TunnelError> {
        if data.is_empty() {
            return Ok(false);
        }
        self.ensure_metadata().await?;

        let index = self.next_chunk;
        let len = data.len() as u64;
        let path = self.paths.request_data_chunk(self.request_id(), index);
        self.store.upload_file(&path, data).await?;
        self.next_chunk += 1;
        self.bytes_written += len;

        tracing::trace!(request_id = %self.metadata.request_id, chunk = index, bytes = len, "Chunk uploaded");

        if self.marker_written {
            return Ok(false);
        }
        self.write_marker(ReadyMarker { total_chunks: 1, total_bytes: len }).await?;
        Ok(true)
    }

    /// Close the round's write side. Publishes an empty round if nothing
    /// was written; otherwise a no-op.
    pub async fn finish(&mut self) -> Result<bool, TunnelError> {
        if self.marker_written {
            return Ok(false);
        }
        self.ensure_metadata().await?;
        self.write_marker(ReadyMarker { total_chunks: 0, total_bytes: 0 }).await?;
        Ok(true)
    }

    async fn ensure_metadata(&mut self) -> Result<(), TunnelError> {
        if self.metadata_written {
            return Ok(());
        }
        let body = encode(&self.metadata, "request metadata")?;
        let path = self.paths.request_metadata(self.request_id());
        self.store.upload_file(&path, body).await?;
        self.metadata_written = true;
        Ok(())
    }

    async fn write_marker(&mut self, marker: ReadyMarker) -> Result<(), TunnelError> {
        let body = encode(&marker, "readiness marker")?;
        let path = self.paths.request_data_ready(self.request_id());
        self.store.upload_file(&path, body).await?;
        self.marker_written = true;
        tracing::debug!(
            request_id = %self.metadata.request_id,
            total_chunks = marker.total_chunks,
            total_bytes = marker.total_bytes,
            "Round published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::types::decode;
    use crate::protocol::Target;
    use crate::storage::{MemoryStore, ObjectStore};

    const ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn composer(store: &MemoryStore) -> RequestComposer {
        let meta = RequestMetadata::new(ID, &Target::new("example.com", 80));
        RequestComposer::new(Arc::new(store.clone()), PathScheme::new("requests", "responses"), meta)
    }

    async fn marker(store: &MemoryStore) -> ReadyMarker {
        let body = store.download_file(&format!("requests/{}.ready", ID)).await.unwrap();
        decode(&body, "marker").unwrap()
    }

    #[tokio::test]
    async fn first_write_publishes_provisional_marker() {
        let store = MemoryStore::new();
        let mut composer = composer(&store);

        assert!(composer.write(Bytes::from_static(b"hello")).await.unwrap());
        assert!(store.contains(&format!("requests/{}.req", ID)));
        assert!(store.contains(&format!("requests/{}.chunk.0", ID)));
        assert_eq!(marker(&store).await, ReadyMarker { total_chunks: 1, total_bytes: 5 });

        assert!(!composer.write(Bytes::from_static(b" world")).await.unwrap());
        assert!(store.contains(&format!("requests/{}.chunk.1", ID)));
        assert_eq!(marker(&store).await, ReadyMarker { total_chunks: 1, total_bytes: 5 });

        assert!(!composer.finish().await.unwrap());
        assert_eq!(composer.chunks_written(), 2);
        assert_eq!(composer.bytes_written(), 11);
    }

    #[tokio::test]
    async fn empty_round_is_published_on_finish() {
        let store = MemoryStore::new();
        let mut composer = composer(&store);

        assert!(!composer.write(Bytes::new()).await.unwrap());
        assert!(store.is_empty());

        assert!(composer.finish().await.unwrap());
        assert!(store.contains(&format!("requests/{}.req", ID)));
        assert_eq!(marker(&store).await, ReadyMarker { total_chunks: 0, total_bytes: 0 });
        assert!(!store.contains(&format!("requests/{}.chunk.0", ID)));
    }

    #[tokio::test]
    async fn chunks_concatenate_to_the_written_stream() {
        let store = MemoryStore::new();
        let mut composer = composer(&store);
        let writes: [&[u8]; 4] = [b"GET / ", b"HTTP/1.1\r\n", b"Host: x\r\n", b"\r\n"];
        for w in writes {
            composer.write(Bytes::copy_from_slice(w)).await.unwrap();
        }
        composer.finish().await.unwrap();

        let mut joined = Vec::new();
        for n in 0..composer.chunks_written() {
            let chunk = store.download_file(&format!("requests/{}.chunk.{}", ID, n)).await.unwrap();
            joined.extend_from_slice(&chunk);
        }
        assert_eq!(joined, writes.concat());
    }
}
