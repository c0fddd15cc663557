//! CALLER role: SOCKS5 in, store objects out.
//!
//! # Data Flow
//! ```text
//! SOCKS5 client
//!     → socks5.rs (handshake, relay)
//!     → connector.rs (TunnelReader / TunnelWriter pair)
//!     → round.rs (one driver task per connection)
//!         → composer.rs (metadata, chunks, readiness marker)
//!         → poller.rs (response / error object)
//!     ← response bytes back through the relay
//! ```
//!
//! # Design Decisions
//! - The session registry decides session ids; the round driver owns
//!   everything else about a connection
//! - Store failures surface on the reader side, never from `send`

pub mod composer;
pub mod connector;
pub mod error;
pub mod poller;
pub mod round;
pub mod service;
pub mod sessions;
pub mod socks5;

pub use connector::{TunnelConnector, TunnelReader, TunnelWriter};
pub use error::TunnelError;
pub use service::CallerService;
pub use sessions::{CallerSessionRegistry, SessionTicket};
