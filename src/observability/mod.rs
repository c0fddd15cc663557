//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured events inside component spans)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (plain or JSON lines)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Request and session ids are span/event fields, never metric labels
//! - Components receive their span explicitly at construction
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
