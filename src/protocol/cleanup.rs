//! Per-round request object cleanup.
//!
//! # Responsibilities
//! - Delete metadata, consolidated payload, every chunk and the readiness marker
//! - Tolerate objects that are already gone
//!
//! # Design Decisions
//! - Chunks are found by listing, so chunks written after the provisional
//!   marker are removed too
//! - Response/error objects are not touched; their consumer deletes them
//! - Failures are logged and counted, never propagated: a stuck delete must
//!   not turn a successful round into a failed one

use crate::protocol::paths::{classify_object, ObjectKind, PathScheme};
use crate::storage::ObjectStore;

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Remove all request-side objects of `request_id`. Idempotent.
pub async fn cleanup_request(
    store: &dyn ObjectStore,
    paths: &PathScheme,
    request_id: &str,
) -> CleanupReport {
    let mut targets = vec![
        paths.request_metadata(request_id),
        paths.request_data(request_id),
        paths.request_data_ready(request_id),
    ];

    match store.list_files(paths.requests_folder()).await {
        Ok(files) => {
            for file in files {
                if let Some((id, ObjectKind::Chunk(index))) = classify_object(&file.name) {
                    if id == request_id {
                        targets.push(paths.request_data_chunk(request_id, index));
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(request_id, error = %e, "Listing for cleanup failed; deleting chunk 0 only");
            targets.push(paths.request_data_chunk(request_id, 0));
        }
    }

    let mut report = CleanupReport::default();
    for path in targets {
        match store.delete_file(&path).await {
            Ok(()) => report.deleted += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(request_id, path = %path, error = %e, "Failed to delete request object");
            }
        }
    }

    tracing::debug!(request_id, deleted = report.deleted, failed = report.failed, "Request objects cleaned up");
    report
}
