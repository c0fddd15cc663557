//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! SOCKS5 client connection
//!     → listener.rs (accept loop, connection limit)
//!     → caller::service (handshake, tunnel, relay)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - The permit travels with the connection task and frees the slot on drop

pub mod listener;

pub use listener::{BoundedListener, ConnectionPermit, ListenerError};
