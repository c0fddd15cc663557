//! Store-mediated stream protocol.
//!
//! # Data Flow
//! ```text
//! CALLER                                   LISTENER
//!   R/I.req ─────────────┐
//!   R/I.chunk.0..N ──────┤  (store)  ──▶  monitor discovers I.req
//!   R/I.ready ───────────┘                 processor reads chunks after .ready
//!                                          processor writes P/I.resp | P/I.error
//!   poller takes P/I.resp | P/I.error ◀──  cleanup deletes R/I.*
//! ```
//!
//! # Design Decisions
//! - One module owns naming (paths.rs); both roles import it
//! - Presence of an object is the only signal; there is no push channel
//! - A round's chunks are written before its readiness marker

pub mod cleanup;
pub mod paths;
pub mod types;

pub use paths::{normalize_path, parse_request_id, paths_match, PathScheme};
pub use types::{ErrorCode, ErrorObject, ProtocolError, ReadyMarker, RequestMetadata, Target};
