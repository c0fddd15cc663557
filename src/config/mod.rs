//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → loader.rs (TUNNEL_* environment overrides)
//!     → validation.rs (semantic checks)
//!     → TunnelConfig (validated, immutable)
//!     → cloned into each role's components
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Both roles read the same file so the folder layout cannot diverge
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::CallerConfig;
pub use schema::ListenerConfig;
pub use schema::ObservabilityConfig;
pub use schema::ProtocolConfig;
pub use schema::RetryConfig;
pub use schema::SessionConfig;
pub use schema::StorageConfig;
pub use schema::TunnelConfig;
