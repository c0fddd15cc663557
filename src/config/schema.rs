//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for both tunnel
//! roles. All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the tunnel.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TunnelConfig {
    /// Object store backend shared by CALLER and LISTENER.
    pub storage: StorageConfig,

    /// Folder layout and protocol timing.
    pub protocol: ProtocolConfig,

    /// Session continuity settings.
    pub sessions: SessionConfig,

    /// LISTENER-side socket settings.
    pub listener: ListenerConfig,

    /// CALLER-side SOCKS5 front end.
    pub caller: CallerConfig,

    /// Store retry configuration.
    pub retries: RetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Object store backend selection.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-process map. Only meaningful when both roles share one process.
    Memory,

    /// A directory visible to both processes (e.g. a synced folder).
    Filesystem { root: String },

    /// REST-style blob endpoint.
    Http {
        base_url: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_http_timeout")]
        request_timeout_secs: u64,
    },
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Filesystem {
            root: "./tunnel-store".to_string(),
        }
    }
}

/// Protocol folders and polling cadence.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Folder holding `.req`, `.chunk.N`, `.ready` and `.data` objects.
    pub requests_folder: String,

    /// Folder holding `.resp` and `.error` objects.
    pub responses_folder: String,

    /// Delay between store listings in milliseconds.
    pub poll_interval_ms: u64,

    /// How long the CALLER waits for a response or error object.
    pub response_timeout_ms: u64,

    /// LISTENER connect timeout towards the target.
    pub connection_timeout_ms: u64,

    /// How long the LISTENER waits for a readiness marker before
    /// proceeding with an empty payload.
    pub payload_wait_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            requests_folder: "requests".to_string(),
            responses_folder: "responses".to_string(),
            poll_interval_ms: 500,
            response_timeout_ms: 60_000,
            connection_timeout_ms: 10_000,
            payload_wait_ms: 10_000,
        }
    }
}

impl ProtocolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn payload_wait(&self) -> Duration {
        Duration::from_millis(self.payload_wait_ms)
    }
}

/// Session continuity configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Target ports whose connections span several rounds.
    pub session_ports: Vec<u16>,

    /// Idle time after which a session is reclaimed on either side.
    pub idle_timeout_ms: u64,

    /// Cadence of the idle sweep.
    pub sweep_interval_ms: u64,

    /// How long the CALLER keeps a finished round open waiting for the
    /// client to send the next record set.
    pub next_round_wait_ms: u64,

    /// Granularity of the next-round wait; bytes arriving within one
    /// check interval are coalesced into one chunk.
    pub next_round_check_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ports: vec![443],
            idle_timeout_ms: 60_000,
            sweep_interval_ms: 10_000,
            next_round_wait_ms: 15_000,
            next_round_check_ms: 100,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn next_round_wait(&self) -> Duration {
        Duration::from_millis(self.next_round_wait_ms)
    }

    pub fn next_round_check(&self) -> Duration {
        Duration::from_millis(self.next_round_check_ms)
    }
}

/// LISTENER configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Per-read timeout of the response read loop.
    pub read_attempt_timeout_ms: u64,

    /// Overall read window; also the minimum wait for the first byte.
    pub read_timeout_ms: u64,

    /// Quiet period after the last byte that ends a plain read.
    pub read_idle_timeout_ms: u64,

    /// Idle window for session connections (multi-record responses).
    pub session_read_idle_timeout_ms: u64,

    /// Maximum number of rounds processed concurrently.
    pub max_concurrent_requests: usize,

    /// Cap on bytes a session drains between rounds before it is dropped.
    pub max_buffered_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            read_attempt_timeout_ms: 1_000,
            read_timeout_ms: 5_000,
            read_idle_timeout_ms: 5_000,
            session_read_idle_timeout_ms: 10_000,
            max_concurrent_requests: 256,
            max_buffered_bytes: 16 * 1024 * 1024,
        }
    }
}

/// CALLER configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CallerConfig {
    /// SOCKS5 bind address.
    pub bind_address: String,

    /// Maximum concurrent SOCKS5 clients (backpressure).
    pub max_connections: usize,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:1080".to_string(),
            max_connections: 1_024,
        }
    }
}

/// Retry configuration for store calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
