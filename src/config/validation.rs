//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ports valid)
//! - Catch folder layouts that would make both sides collide
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TunnelConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{StorageConfig, TunnelConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("requests and responses folders must differ (both are '{0}')")]
    SharedFolder(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("poll interval ({poll_ms}ms) must be below the response timeout ({timeout_ms}ms)")]
    PollSlowerThanTimeout { poll_ms: u64, timeout_ms: u64 },

    #[error("session port 0 is not a valid TCP port")]
    SessionPortZero,

    #[error("invalid bind address '{0}'")]
    BindAddress(String),

    #[error("invalid store URL '{0}'")]
    StoreUrl(String),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &TunnelConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let protocol = &config.protocol;

    let requests = protocol.requests_folder.trim_matches('/');
    let responses = protocol.responses_folder.trim_matches('/');
    if requests.is_empty() {
        errors.push(ValidationError::EmptyField("protocol.requests_folder"));
    }
    if responses.is_empty() {
        errors.push(ValidationError::EmptyField("protocol.responses_folder"));
    }
    if !requests.is_empty() && requests == responses {
        errors.push(ValidationError::SharedFolder(requests.to_string()));
    }

    let must_be_positive = [
        ("protocol.poll_interval_ms", protocol.poll_interval_ms),
        ("protocol.response_timeout_ms", protocol.response_timeout_ms),
        ("protocol.connection_timeout_ms", protocol.connection_timeout_ms),
        ("sessions.idle_timeout_ms", config.sessions.idle_timeout_ms),
        ("sessions.sweep_interval_ms", config.sessions.sweep_interval_ms),
        ("sessions.next_round_check_ms", config.sessions.next_round_check_ms),
        ("listener.read_attempt_timeout_ms", config.listener.read_attempt_timeout_ms),
        ("listener.max_concurrent_requests", config.listener.max_concurrent_requests as u64),
        ("listener.max_buffered_bytes", config.listener.max_buffered_bytes as u64),
        ("caller.max_connections", config.caller.max_connections as u64),
        ("retries.max_attempts", config.retries.max_attempts as u64),
    ];
    for (name, value) in must_be_positive {
        if value == 0 {
            errors.push(ValidationError::Zero(name));
        }
    }

    if protocol.poll_interval_ms > 0
        && protocol.response_timeout_ms > 0
        && protocol.poll_interval_ms >= protocol.response_timeout_ms
    {
        errors.push(ValidationError::PollSlowerThanTimeout {
            poll_ms: protocol.poll_interval_ms,
            timeout_ms: protocol.response_timeout_ms,
        });
    }

    if config.sessions.session_ports.contains(&0) {
        errors.push(ValidationError::SessionPortZero);
    }

    if config.caller.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.caller.bind_address.clone()));
    }

    match &config.storage {
        StorageConfig::Filesystem { root } if root.trim().is_empty() => {
            errors.push(ValidationError::EmptyField("storage.root"));
        }
        StorageConfig::Http { base_url, .. } => {
            if url::Url::parse(base_url).is_err() {
                errors.push(ValidationError::StoreUrl(base_url.clone()));
            }
        }
        _ => {}
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
