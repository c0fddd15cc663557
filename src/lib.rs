//! TCP tunnel that relays bytes through a shared object store.

// Roles
pub mod caller;
pub mod listener;

// Wire format and transport
pub mod net;
pub mod protocol;
pub mod storage;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use caller::CallerService;
pub use config::TunnelConfig;
pub use lifecycle::Shutdown;
pub use listener::ListenerService;
