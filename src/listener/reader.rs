//! Adaptive response read loop.
//!
//! # Design Decisions
//! - Each read attempt is bounded by `attempt_timeout`; that is only the
//!   polling granularity, never a reason to stop on its own
//! - Before the first byte, the loop waits up to
//!   `max(overall_timeout, idle_timeout)`; session ports get the wider
//!   idle window because their first reply can be a multi-record flight
//! - After the first byte, the read ends once `idle_timeout` has passed
//!   since the last byte and `overall_timeout` since the start
//! - A clean close ends the read successfully with whatever arrived
//! - An error after some bytes returns those bytes as a success

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

use crate::config::ListenerConfig;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPolicy {
    pub attempt_timeout: Duration,
    pub overall_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ReadPolicy {
    pub fn from_config(config: &ListenerConfig, session: bool) -> Self {
        let idle_ms = if session {
            config.session_read_idle_timeout_ms
        } else {
            config.read_idle_timeout_ms
        };
        Self {
            attempt_timeout: Duration::from_millis(config.read_attempt_timeout_ms),
            overall_timeout: Duration::from_millis(config.read_timeout_ms),
            idle_timeout: Duration::from_millis(idle_ms),
        }
    }

    fn first_byte_wait(&self) -> Duration {
        self.overall_timeout.max(self.idle_timeout)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    pub data: Bytes,
    /// The peer closed (or broke) the connection during the read.
    pub closed: bool,
}

/// Read one response from `reader` under `policy`.
pub async fn read_response<R>(reader: &mut R, policy: ReadPolicy) -> io::Result<ReadOutcome>
where
    R: AsyncRead + Unpin,
{
    let started = Instant::now();
    let mut last_byte_at = started;
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);
        match tokio::time::timeout(policy.attempt_timeout, reader.read_buf(&mut buf)).await {
            Ok(Ok(0)) => {
                return Ok(ReadOutcome { data: buf.freeze(), closed: true });
            }
            Ok(Ok(_)) => last_byte_at = Instant::now(),
            Ok(Err(e)) if !buf.is_empty() => {
                tracing::debug!(error = %e, bytes = buf.len(), "Read failed after partial data; keeping it");
                return Ok(ReadOutcome { data: buf.freeze(), closed: true });
            }
            Ok(Err(e)) => return Err(e),
            Err(_) if !buf.is_empty() => {
                if last_byte_at.elapsed() >= policy.idle_timeout && started.elapsed() >= policy.overall_timeout {
                    return Ok(ReadOutcome { data: buf.freeze(), closed: false });
                }
            }
            Err(_) => {
                if started.elapsed() >= policy.first_byte_wait() {
                    tracing::debug!(waited = ?started.elapsed(), "No response bytes");
                    return Ok(ReadOutcome::default());
                }
            }
        }
    }
}
