//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tunnel_rounds_total` (counter): finished rounds by side and outcome
//! - `tunnel_store_retries_total` (counter): retried store calls by operation
//! - `tunnel_sessions_total` (counter): session lifecycle events by side
//! - `tunnel_sessions_active` (gauge): live sessions by side
//!
//! # Design Decisions
//! - Recording is a no-op until `init_metrics` installs the exporter
//! - Labels are low-cardinality (no request or session ids)

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a finished round. `side` is "caller" or "listener".
pub fn record_round(side: &'static str, outcome: &'static str) {
    metrics::counter!("tunnel_rounds_total", "side" => side, "outcome" => outcome).increment(1);
}

pub fn record_store_retry(op: &'static str) {
    metrics::counter!("tunnel_store_retries_total", "op" => op).increment(1);
}

pub fn record_session_event(side: &'static str, event: &'static str) {
    metrics::counter!("tunnel_sessions_total", "side" => side, "event" => event).increment(1);
}

pub fn record_active_sessions(side: &'static str, count: usize) {
    metrics::gauge!("tunnel_sessions_active", "side" => side).set(count as f64);
}
