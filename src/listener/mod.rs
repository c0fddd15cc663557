//! LISTENER role: store objects in, real TCP out.
//!
//! # Data Flow
//! ```text
//! requests folder
//!     → monitor.rs (listing, known set)
//!     → service.rs (bounded concurrency)
//!     → processor.rs (metadata, payload, result, cleanup)
//!         → sessions.rs (one actor per live session socket)
//!         → dial.rs / reader.rs (one-shot connections, adaptive read)
//!     → responses folder
//! ```
//!
//! # Design Decisions
//! - Requests present at startup belong to a previous run and are ignored
//! - Every discovered round ends with exactly one result object attempt
//!   and a cleanup pass, whatever the outcome

pub mod dial;
pub mod monitor;
pub mod processor;
pub mod reader;
pub mod service;
pub mod sessions;

pub use monitor::{KnownRequests, RequestMonitor};
pub use processor::{RequestProcessor, RoundOutcome};
pub use service::ListenerService;
pub use sessions::{ListenerSessionRegistry, SessionError, SessionHandle};
