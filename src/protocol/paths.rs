//! Object naming shared by both roles.
//!
//! Given folders `R` (requests) and `P` (responses) and request id `I`:
//!
//! ```text
//! R/I.req        request metadata (JSON)
//! R/I.data       consolidated payload (legacy writers)
//! R/I.chunk.N    payload chunk N, N = 0, 1, 2, ...
//! R/I.ready      readiness marker (JSON {totalChunks,totalBytes})
//! P/I.resp       response bytes
//! P/I.error      error object (JSON)
//! ```
//!
//! Every other module builds names through [`PathScheme`]; nothing formats
//! these suffixes by hand.

use crate::config::ProtocolConfig;

pub const METADATA_SUFFIX: &str = ".req";
pub const DATA_SUFFIX: &str = ".data";
pub const CHUNK_INFIX: &str = ".chunk.";
pub const READY_SUFFIX: &str = ".ready";
pub const RESPONSE_SUFFIX: &str = ".resp";
pub const ERROR_SUFFIX: &str = ".error";

/// Which protocol object a file name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Metadata,
    Data,
    Chunk(u32),
    Ready,
    Response,
    Error,
}

/// Folder-parameterized mapping from request id to object paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathScheme {
    requests: String,
    responses: String,
}

impl PathScheme {
    pub fn new(requests_folder: &str, responses_folder: &str) -> Self {
        Self {
            requests: requests_folder.trim_matches('/').to_string(),
            responses: responses_folder.trim_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(&config.requests_folder, &config.responses_folder)
    }

    pub fn requests_folder(&self) -> &str {
        &self.requests
    }

    pub fn responses_folder(&self) -> &str {
        &self.responses
    }

    pub fn request_metadata(&self, request_id: &str) -> String {
        format!("{}/{}{}", self.requests, request_id, METADATA_SUFFIX)
    }

    pub fn request_data(&self, request_id: &str) -> String {
        format!("{}/{}{}", self.requests, request_id, DATA_SUFFIX)
    }

    pub fn request_data_chunk(&self, request_id: &str, index: u32) -> String {
        format!("{}/{}{}{}", self.requests, request_id, CHUNK_INFIX, index)
    }

    pub fn request_data_ready(&self, request_id: &str) -> String {
        format!("{}/{}{}", self.requests, request_id, READY_SUFFIX)
    }

    pub fn response(&self, request_id: &str) -> String {
        format!("{}/{}{}", self.responses, request_id, RESPONSE_SUFFIX)
    }

    pub fn error(&self, request_id: &str) -> String {
        format!("{}/{}{}", self.responses, request_id, ERROR_SUFFIX)
    }
}

/// Split a bare file name into request id and object kind.
///
/// Returns `None` for names with a directory component, unknown suffixes,
/// or ids that are not UUIDs.
pub fn classify_object(file_name: &str) -> Option<(String, ObjectKind)> {
    if file_name.contains('/') || file_name.contains('\\') {
        return None;
    }

    let (id, kind) = if let Some(id) = file_name.strip_suffix(METADATA_SUFFIX) {
        (id, ObjectKind::Metadata)
    } else if let Some(id) = file_name.strip_suffix(DATA_SUFFIX) {
        (id, ObjectKind::Data)
    } else if let Some(id) = file_name.strip_suffix(READY_SUFFIX) {
        (id, ObjectKind::Ready)
    } else if let Some(id) = file_name.strip_suffix(RESPONSE_SUFFIX) {
        (id, ObjectKind::Response)
    } else if let Some(id) = file_name.strip_suffix(ERROR_SUFFIX) {
        (id, ObjectKind::Error)
    } else {
        let (id, index) = file_name.rsplit_once(CHUNK_INFIX)?;
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        (id, ObjectKind::Chunk(index.parse().ok()?))
    };

    // Validate only; the id must round-trip to the object names it came from.
    uuid::Uuid::parse_str(id).ok()?;
    Some((id.to_string(), kind))
}

/// Request id carried by a bare protocol file name.
pub fn parse_request_id(file_name: &str) -> Option<String> {
    classify_object(file_name).map(|(id, _)| id)
}

/// Canonical form of a store-reported path.
///
/// Stores disagree on separators, leading slashes, drive-style roots
/// (`/drive/root:/requests/x.req`) and absolute URLs. All of that is
/// stripped so that paths from listings compare equal to scheme paths.
pub fn normalize_path(path: &str) -> String {
    let mut path = path.replace('\\', "/");

    for scheme in ["https://", "http://"] {
        if let Some(rest) = path.strip_prefix(scheme) {
            path = rest.split_once('/').map(|(_, p)| p.to_string()).unwrap_or_default();
            break;
        }
    }
    if let Some((_, rest)) = path.rsplit_once(":/") {
        path = rest.to_string();
    }

    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a listed path refers to the object at `expected`.
///
/// A listed path may carry extra leading segments (a store-side base
/// folder), so a suffix match on a segment boundary is accepted.
pub fn paths_match(listed: &str, expected: &str) -> bool {
    let listed = normalize_path(listed);
    let expected = normalize_path(expected);
    listed == expected || listed.ends_with(&format!("/{}", expected))
}
