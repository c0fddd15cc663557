//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast → accept loop / monitor / sweepers exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then store, then loops
//! - A single broadcast reaches every long-running task

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
