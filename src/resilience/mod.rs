//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Store call (list / download / upload / delete):
//!     → retries.rs (classify failure via Retryable)
//!     → backoff.rs (exponential delay, or server Retry-After)
//!     → retry or surface typed error
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Transient store failures (5xx, 429, transport) never reach protocol code
//! - 401/403 fail fast: retrying cannot fix credentials

pub mod backoff;
pub mod retries;
