//! Serves one discovered round end to end.
//!
//! # Data Flow
//! ```text
//! request id
//!     → dedup guard
//!     → metadata (download, parse, validate)
//!     → payload (.data, else wait for .ready and join chunks)
//!     → connection (session actor, or a fresh dial)
//!     → write payload, adaptive read
//!     → publish .resp or .error
//!     → cleanup, forget in known set
//!     → keep-alive sessions go back to draining
//! ```
//!
//! # Design Decisions
//! - Exactly one of `.resp` / `.error` is attempted per round
//! - A missing metadata object means the round was already cleaned up
//!   (stale listing); it is dropped without an error object
//! - A missing readiness marker degrades to an empty payload
//! - Marker sizes come from the store and are never trusted for allocation
//! - A response that cannot be uploaded is reported through `.error`
//! - Rounds already past the payload step publish a result even if the
//!   CALLER has gone away

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashSet;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{Instrument, Span};

use crate::config::{ListenerConfig, ProtocolConfig, SessionConfig};
use crate::listener::dial::dial;
use crate::listener::monitor::KnownRequests;
use crate::listener::reader::{read_response, ReadOutcome, ReadPolicy};
use crate::listener::sessions::{ListenerSessionRegistry, SessionError};
use crate::observability::metrics;
use crate::protocol::cleanup::cleanup_request;
use crate::protocol::paths::{classify_object, ObjectKind};
use crate::protocol::types::{decode, encode};
use crate::protocol::{ErrorCode, ErrorObject, PathScheme, ReadyMarker, RequestMetadata, Target};
use crate::storage::{SharedStore, StorageError};

/// Upper bound on the payload buffer reserved from a readiness marker.
const MAX_PAYLOAD_PREALLOC: u64 = 1024 * 1024;

/// What happened to a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Another task is already serving this id.
    Skipped,
    /// Metadata was gone before it could be read.
    Vanished,
    Responded { bytes: usize },
    Failed { code: ErrorCode },
}

/// Timing the processor needs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub poll_interval: Duration,
    pub payload_wait: Duration,
    pub connect_timeout: Duration,
    pub session_ports: Vec<u16>,
    pub plain_read: ReadPolicy,
    pub session_read: ReadPolicy,
}

impl ProcessorSettings {
    pub fn from_config(protocol: &ProtocolConfig, sessions: &SessionConfig, listener: &ListenerConfig) -> Self {
        Self {
            poll_interval: protocol.poll_interval(),
            payload_wait: protocol.payload_wait(),
            connect_timeout: protocol.connection_timeout(),
            session_ports: sessions.session_ports.clone(),
            plain_read: ReadPolicy::from_config(listener, false),
            session_read: ReadPolicy::from_config(listener, true),
        }
    }
}

/// Removes the id from the in-flight set on drop.
struct InFlightGuard {
    set: Arc<DashSet<String>>,
    request_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.request_id);
    }
}

pub struct RequestProcessor {
    store: SharedStore,
    paths: PathScheme,
    settings: ProcessorSettings,
    sessions: Arc<ListenerSessionRegistry>,
    known: KnownRequests,
    in_flight: Arc<DashSet<String>>,
    span: Span,
}

/// Failure of the connection phase, already classified.
struct RoundFailure {
    code: ErrorCode,
    message: String,
}

impl From<SessionError> for RoundFailure {
    fn from(e: SessionError) -> Self {
        Self { code: e.code(), message: e.to_string() }
    }
}

impl From<std::io::Error> for RoundFailure {
    fn from(e: std::io::Error) -> Self {
        Self { code: ErrorCode::from_io(&e), message: e.to_string() }
    }
}

impl RequestProcessor {
    pub fn new(
        store: SharedStore,
        paths: PathScheme,
        settings: ProcessorSettings,
        sessions: Arc<ListenerSessionRegistry>,
        known: KnownRequests,
        span: Span,
    ) -> Self {
        Self {
            store,
            paths,
            settings,
            sessions,
            known,
            in_flight: Arc::new(DashSet::new()),
            span,
        }
    }

    pub fn sessions(&self) -> &Arc<ListenerSessionRegistry> {
        &self.sessions
    }

    /// Serve `request_id`.
    pub async fn process(&self, request_id: &str) -> RoundOutcome {
        if !self.in_flight.insert(request_id.to_string()) {
            tracing::debug!(request_id, "Already in flight");
            return RoundOutcome::Skipped;
        }
        let _guard = InFlightGuard {
            set: self.in_flight.clone(),
            request_id: request_id.to_string(),
        };

        let span = tracing::info_span!(parent: &self.span, "round", request_id);
        let outcome = self.process_round(request_id).instrument(span).await;

        let label = match &outcome {
            RoundOutcome::Skipped => "skipped",
            RoundOutcome::Vanished => "vanished",
            RoundOutcome::Responded { .. } => "response",
            RoundOutcome::Failed { .. } => "error",
        };
        metrics::record_round("listener", label);
        outcome
    }

    async fn process_round(&self, request_id: &str) -> RoundOutcome {
        let metadata = match self.read_metadata(request_id).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                tracing::debug!("Metadata already gone; dropping stale discovery");
                self.known.forget(&self.paths.request_metadata(request_id));
                return RoundOutcome::Vanished;
            }
            Err((code, message)) => {
                tracing::warn!(code = %code, error = %message, "Rejecting round");
                self.publish_error(request_id, code, &message).await;
                self.cleanup(request_id).await;
                return RoundOutcome::Failed { code };
            }
        };

        let target = match metadata.validate() {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid metadata");
                self.publish_error(request_id, ErrorCode::InvalidRequest, &e.to_string()).await;
                self.cleanup(request_id).await;
                return RoundOutcome::Failed { code: ErrorCode::InvalidRequest };
            }
        };

        let payload = self.read_payload(request_id).await;
        tracing::debug!(goal = %target, bytes = payload.len(), session_id = ?metadata.session_id(), "Serving round");

        let result = match metadata.session_id() {
            Some(session_id) => self.exchange_in_session(session_id, &metadata, &target, payload).await,
            None => self.exchange_once(&target, payload).await,
        };

        let outcome = match result {
            Ok(read) => {
                let bytes = read.data.len();
                let path = self.paths.response(request_id);
                match self.store.upload_file(&path, read.data).await {
                    Ok(()) => {
                        tracing::debug!(bytes, closed = read.closed, "Response published");
                        RoundOutcome::Responded { bytes }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, bytes, "Failed to publish response");
                        self.publish_error(request_id, ErrorCode::StorageError, &e.to_string()).await;
                        RoundOutcome::Failed { code: ErrorCode::StorageError }
                    }
                }
            }
            Err(failure) => {
                tracing::warn!(code = %failure.code, error = %failure.message, "Round failed");
                self.publish_error(request_id, failure.code, &failure.message).await;
                RoundOutcome::Failed { code: failure.code }
            }
        };

        self.cleanup(request_id).await;

        if let Some(session_id) = metadata.session_id() {
            let keep = metadata.keeps_session_alive() && matches!(outcome, RoundOutcome::Responded { .. });
            if keep {
                if let Err(e) = self.sessions.start_continuous_reading(session_id).await {
                    tracing::debug!(session_id, error = %e, "Session not resumable; closing");
                    self.sessions.close(session_id);
                }
            } else {
                self.sessions.close(session_id);
            }
        }

        outcome
    }

    /// `Ok(None)` when the metadata object does not exist.
    async fn read_metadata(&self, request_id: &str) -> Result<Option<RequestMetadata>, (ErrorCode, String)> {
        let path = self.paths.request_metadata(request_id);
        let body = match self.store.download_file(&path).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err((ErrorCode::StorageError, e.to_string())),
        };
        decode::<RequestMetadata>(&body, "request metadata")
            .map(Some)
            .map_err(|e| (ErrorCode::InvalidRequest, e.to_string()))
    }

    /// Consolidated payload if present, else chunks after the readiness
    /// marker, else empty after `payload_wait`.
    async fn read_payload(&self, request_id: &str) -> Bytes {
        match self.store.download_file(&self.paths.request_data(request_id)).await {
            Ok(data) => return data,
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(error = %e, "Consolidated payload read failed"),
        }

        let deadline = Instant::now() + self.settings.payload_wait;
        let ready_path = self.paths.request_data_ready(request_id);
        loop {
            match self.store.download_file(&ready_path).await {
                Ok(body) => match decode::<ReadyMarker>(&body, "readiness marker") {
                    Ok(marker) => return self.assemble_chunks(request_id, marker, deadline).await,
                    Err(e) => tracing::warn!(error = %e, "Unreadable readiness marker"),
                },
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!(error = %e, "Readiness marker read failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(waited = ?self.settings.payload_wait, "No readiness marker; proceeding with empty payload");
                return Bytes::new();
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }

    /// Join chunks `0..total_chunks`, then any contiguous chunks listed
    /// beyond the marker's count.
    async fn assemble_chunks(&self, request_id: &str, marker: ReadyMarker, deadline: Instant) -> Bytes {
        let reserve = marker.total_bytes.min(MAX_PAYLOAD_PREALLOC) as usize;
        let mut payload = BytesMut::with_capacity(reserve);
        let mut index = 0u32;

        while index < marker.total_chunks {
            match self.fetch_chunk(request_id, index, deadline).await {
                Ok(chunk) => payload.extend_from_slice(&chunk),
                Err(e) => {
                    tracing::warn!(chunk = index, error = %e, "Chunk unavailable; truncating payload");
                    return payload.freeze();
                }
            }
            index += 1;
        }

        let listed = self.listed_chunk_indices(request_id).await;
        while listed.contains(&index) {
            match self.store.download_file(&self.paths.request_data_chunk(request_id, index)).await {
                Ok(chunk) => payload.extend_from_slice(&chunk),
                Err(e) => {
                    tracing::debug!(chunk = index, error = %e, "Extra chunk unavailable");
                    break;
                }
            }
            index += 1;
        }

        tracing::debug!(chunks = index, bytes = payload.len(), "Payload assembled");
        payload.freeze()
    }

    /// A counted chunk may lag its marker on an eventually-consistent store.
    async fn fetch_chunk(&self, request_id: &str, index: u32, deadline: Instant) -> Result<Bytes, StorageError> {
        let path = self.paths.request_data_chunk(request_id, index);
        loop {
            match self.store.download_file(&path).await {
                Err(e) if e.is_not_found() && Instant::now() < deadline => {
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                other => return other,
            }
        }
    }

    async fn listed_chunk_indices(&self, request_id: &str) -> Vec<u32> {
        match self.store.list_files(self.paths.requests_folder()).await {
            Ok(files) => files
                .iter()
                .filter_map(|f| match classify_object(&f.name) {
                    Some((id, ObjectKind::Chunk(n))) if id == request_id => Some(n),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                tracing::debug!(error = %e, "Chunk listing failed");
                Vec::new()
            }
        }
    }

    async fn exchange_in_session(
        &self,
        session_id: &str,
        metadata: &RequestMetadata,
        target: &Target,
        payload: Bytes,
    ) -> Result<ReadOutcome, RoundFailure> {
        let handle = self
            .sessions
            .get_or_create(session_id, target, metadata.is_first_in_session())
            .await?;
        Ok(handle.exchange(payload, self.settings.session_read).await?)
    }

    async fn exchange_once(&self, target: &Target, payload: Bytes) -> Result<ReadOutcome, RoundFailure> {
        let mut stream = dial(target, self.settings.connect_timeout).await?;
        if !payload.is_empty() {
            stream.write_all(&payload).await?;
        }
        let policy = if self.settings.session_ports.contains(&target.port) {
            self.settings.session_read
        } else {
            self.settings.plain_read
        };
        let outcome = read_response(&mut stream, policy).await?;
        let _ = stream.shutdown().await;
        Ok(outcome)
    }

    async fn publish_error(&self, request_id: &str, code: ErrorCode, message: &str) {
        let object = ErrorObject::new(request_id, code, message);
        let body = match encode(&object, "error object") {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode error object");
                return;
            }
        };
        if let Err(e) = self.store.upload_file(&self.paths.error(request_id), body).await {
            tracing::error!(error = %e, "Failed to publish error object");
        }
    }

    async fn cleanup(&self, request_id: &str) {
        cleanup_request(self.store.as_ref(), &self.paths, request_id).await;
        self.known.forget(&self.paths.request_metadata(request_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileInfo, MemoryStore, ObjectStore, StorageResult};
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Memory store whose response uploads are rejected.
    struct ReadOnlyResponses(MemoryStore);

    #[async_trait]
    impl ObjectStore for ReadOnlyResponses {
        async fn list_files(&self, folder: &str) -> StorageResult<Vec<FileInfo>> {
            self.0.list_files(folder).await
        }

        async fn download_file(&self, path: &str) -> StorageResult<Bytes> {
            self.0.download_file(path).await
        }

        async fn upload_file(&self, path: &str, data: Bytes) -> StorageResult<()> {
            if path.ends_with(".resp") {
                return Err(StorageError::Http {
                    status: 507,
                    message: "insufficient storage".to_string(),
                    retry_after: None,
                });
            }
            self.0.upload_file(path, data).await
        }

        async fn delete_file(&self, path: &str) -> StorageResult<()> {
            self.0.delete_file(path).await
        }
    }

    const ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn settings() -> ProcessorSettings {
        let quick = ReadPolicy {
            attempt_timeout: Duration::from_millis(50),
            overall_timeout: Duration::from_millis(300),
            idle_timeout: Duration::from_millis(300),
        };
        ProcessorSettings {
            poll_interval: Duration::from_millis(10),
            payload_wait: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(1),
            session_ports: vec![443],
            plain_read: quick,
            session_read: quick,
        }
    }

    fn processor(store: &MemoryStore) -> RequestProcessor {
        processor_over(Arc::new(store.clone()))
    }

    fn processor_over(store: SharedStore) -> RequestProcessor {
        let sessions = Arc::new(ListenerSessionRegistry::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            1024 * 1024,
            Span::none(),
        ));
        RequestProcessor::new(
            store,
            PathScheme::new("requests", "responses"),
            settings(),
            sessions,
            KnownRequests::new(),
            Span::none(),
        )
    }

    /// Answers each connection with `HTTP/1.1 200 OK` plus what it read, then closes.
    async fn http_like_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let mut reply = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
                    reply.extend_from_slice(&buf[..n]);
                    let _ = socket.write_all(&reply).await;
                });
            }
        });
        port
    }

    async fn put_json<T: serde::Serialize>(store: &MemoryStore, path: String, value: &T) {
        store.upload_file(&path, encode(value, "test").unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn serves_a_chunked_round_and_cleans_up() {
        let port = http_like_server().await;
        let store = MemoryStore::new();
        put_json(&store, format!("requests/{}.req", ID), &RequestMetadata::new(ID, &Target::new("127.0.0.1", port))).await;
        store.upload_file(&format!("requests/{}.chunk.0", ID), Bytes::from_static(b"ping")).await.unwrap();
        put_json(&store, format!("requests/{}.ready", ID), &ReadyMarker { total_chunks: 1, total_bytes: 4 }).await;
        store.upload_file(&format!("requests/{}.chunk.1", ID), Bytes::from_static(b"+more")).await.unwrap();

        let outcome = processor(&store).process(ID).await;

        assert_eq!(outcome, RoundOutcome::Responded { bytes: 28 });
        let body = store.download_file(&format!("responses/{}.resp", ID)).await.unwrap();
        assert_eq!(&body[..], b"HTTP/1.1 200 OK\r\n\r\nping+more");
        assert_eq!(store.paths(), vec![format!("responses/{}.resp", ID)]);
    }

    #[tokio::test]
    async fn invalid_metadata_writes_an_error_object() {
        let store = MemoryStore::new();
        let mut meta = RequestMetadata::new(ID, &Target::new("example.com", 80));
        meta.target_port = 70_000;
        put_json(&store, format!("requests/{}.req", ID), &meta).await;

        let outcome = processor(&store).process(ID).await;

        assert_eq!(outcome, RoundOutcome::Failed { code: ErrorCode::InvalidRequest });
        let err: ErrorObject = decode(
            &store.download_file(&format!("responses/{}.error", ID)).await.unwrap(),
            "error",
        )
        .unwrap();
        assert_eq!(err.request_id, ID);
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert!(!store.contains(&format!("responses/{}.resp", ID)));
        assert!(!store.contains(&format!("requests/{}.req", ID)));
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let store = MemoryStore::new();
        put_json(&store, format!("requests/{}.req", ID), &RequestMetadata::new(ID, &Target::new("127.0.0.1", port))).await;
        put_json(&store, format!("requests/{}.ready", ID), &ReadyMarker { total_chunks: 0, total_bytes: 0 }).await;

        let outcome = processor(&store).process(ID).await;

        assert_eq!(outcome, RoundOutcome::Failed { code: ErrorCode::ConnectionError });
        assert!(store.contains(&format!("responses/{}.error", ID)));
        assert!(!store.contains(&format!("responses/{}.resp", ID)));
    }

    #[tokio::test]
    async fn missing_marker_degrades_to_empty_payload() {
        let port = http_like_server().await;
        let store = MemoryStore::new();
        put_json(&store, format!("requests/{}.req", ID), &RequestMetadata::new(ID, &Target::new("127.0.0.1", port))).await;

        let outcome = processor(&store).process(ID).await;

        // Nothing was written, so the GOAL stays silent until the read gives up.
        assert_eq!(outcome, RoundOutcome::Responded { bytes: 0 });
        let body = store.download_file(&format!("responses/{}.resp", ID)).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn consolidated_payload_is_preferred() {
        let port = http_like_server().await;
        let store = MemoryStore::new();
        put_json(&store, format!("requests/{}.req", ID), &RequestMetadata::new(ID, &Target::new("127.0.0.1", port))).await;
        store.upload_file(&format!("requests/{}.data", ID), Bytes::from_static(b"legacy")).await.unwrap();

        processor(&store).process(ID).await;

        let body = store.download_file(&format!("responses/{}.resp", ID)).await.unwrap();
        assert!(body.ends_with(b"legacy"));
        assert!(!store.contains(&format!("requests/{}.data", ID)));
    }

    #[tokio::test]
    async fn vanished_rounds_publish_nothing() {
        let store = MemoryStore::new();
        assert_eq!(processor(&store).process(ID).await, RoundOutcome::Vanished);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn continuation_without_session_is_rejected() {
        let store = MemoryStore::new();
        let meta = RequestMetadata::new(ID, &Target::new("127.0.0.1", 443)).with_session("gone", false);
        put_json(&store, format!("requests/{}.req", ID), &meta).await;
        put_json(&store, format!("requests/{}.ready", ID), &ReadyMarker { total_chunks: 0, total_bytes: 0 }).await;

        let outcome = processor(&store).process(ID).await;
        assert_eq!(outcome, RoundOutcome::Failed { code: ErrorCode::InvalidRequest });
    }

    #[tokio::test]
    async fn oversized_marker_does_not_reserve_its_claim() {
        let port = http_like_server().await;
        for total_bytes in [u64::MAX, 1u64 << 40] {
            let store = MemoryStore::new();
            put_json(&store, format!("requests/{}.req", ID), &RequestMetadata::new(ID, &Target::new("127.0.0.1", port))).await;
            store.upload_file(&format!("requests/{}.chunk.0", ID), Bytes::from_static(b"tiny")).await.unwrap();
            put_json(&store, format!("requests/{}.ready", ID), &ReadyMarker { total_chunks: 1, total_bytes }).await;

            let outcome = processor(&store).process(ID).await;

            assert_eq!(outcome, RoundOutcome::Responded { bytes: 23 });
            let body = store.download_file(&format!("responses/{}.resp", ID)).await.unwrap();
            assert_eq!(&body[..], b"HTTP/1.1 200 OK\r\n\r\ntiny");
        }
    }

    #[tokio::test]
    async fn unpublishable_response_becomes_a_storage_error() {
        let port = http_like_server().await;
        let memory = MemoryStore::new();
        put_json(&memory, format!("requests/{}.req", ID), &RequestMetadata::new(ID, &Target::new("127.0.0.1", port))).await;
        memory.upload_file(&format!("requests/{}.data", ID), Bytes::from_static(b"ping")).await.unwrap();

        let outcome = processor_over(Arc::new(ReadOnlyResponses(memory.clone()))).process(ID).await;

        assert_eq!(outcome, RoundOutcome::Failed { code: ErrorCode::StorageError });
        let err: ErrorObject = decode(
            &memory.download_file(&format!("responses/{}.error", ID)).await.unwrap(),
            "error",
        )
        .unwrap();
        assert_eq!(err.code, ErrorCode::StorageError);
        assert!(!memory.contains(&format!("responses/{}.resp", ID)));
        assert!(!memory.contains(&format!("requests/{}.req", ID)));
    }
}
