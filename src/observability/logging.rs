//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Hand each component its own span instead of a shared logger object
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - RUST_LOG overrides the configured level

use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install the global subscriber. Safe to call once per process.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("store_tunnel={}", config.log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}

/// Span injected into a long-lived component at construction.
///
/// All events the component emits are recorded inside this span, so the
/// role and component name travel with every line without global state.
pub fn component_span(role: &'static str, component: &'static str) -> Span {
    tracing::info_span!("component", role, component)
}
