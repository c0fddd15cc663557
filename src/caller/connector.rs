//! Connection-handler boundary between SOCKS5 and the store protocol.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::Span;

use crate::caller::error::TunnelError;
use crate::caller::poller::ResponsePoller;
use crate::caller::round::{RoundDriver, RoundTiming};
use crate::caller::sessions::CallerSessionRegistry;
use crate::config::{ProtocolConfig, SessionConfig};
use crate::protocol::{PathScheme, ProtocolError, Target};
use crate::storage::SharedStore;

const CHANNEL_CAPACITY: usize = 64;

/// Write half of a tunnel.
pub struct TunnelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl TunnelWriter {
    pub async fn send(&self, data: Bytes) -> Result<(), TunnelError> {
        self.tx.send(data).await.map_err(|_| TunnelError::Closed)
    }

    /// Signal end of client data (half-close).
    pub fn close(self) {}
}

/// Read half of a tunnel. Dropping it cancels the tunnel.
pub struct TunnelReader {
    rx: mpsc::Receiver<Result<Bytes, TunnelError>>,
}

impl TunnelReader {
    /// Next response bytes; `None` once the tunnel has closed.
    pub async fn recv(&mut self) -> Option<Result<Bytes, TunnelError>> {
        self.rx.recv().await
    }
}

/// Opens store-mediated tunnels.
#[derive(Clone)]
pub struct TunnelConnector {
    store: SharedStore,
    paths: PathScheme,
    poller: ResponsePoller,
    sessions: Arc<CallerSessionRegistry>,
    timing: RoundTiming,
    span: Span,
}

impl TunnelConnector {
    pub fn new(
        store: SharedStore,
        protocol: &ProtocolConfig,
        session_config: &SessionConfig,
        sessions: Arc<CallerSessionRegistry>,
        span: Span,
    ) -> Self {
        Self {
            poller: ResponsePoller::new(store.clone(), protocol, span.clone()),
            store,
            paths: PathScheme::from_config(protocol),
            sessions,
            timing: RoundTiming {
                next_round_wait: session_config.next_round_wait(),
                next_round_check: session_config.next_round_check(),
            },
            span,
        }
    }

    pub fn sessions(&self) -> &Arc<CallerSessionRegistry> {
        &self.sessions
    }

    /// Open a tunnel to `address:port`.
    ///
    /// Nothing touches the store until the client writes or closes, so this
    /// only fails for targets that no LISTENER could dial.
    pub fn connect(&self, address: &str, port: u16) -> Result<(TunnelReader, TunnelWriter), TunnelError> {
        if address.trim().is_empty() {
            return Err(ProtocolError::InvalidTarget("empty target address".to_string()).into());
        }
        if port == 0 {
            return Err(ProtocolError::InvalidTarget("target port 0".to_string()).into());
        }
        let target = Target::new(address.trim(), port);
        let ticket = self.sessions.resolve_session(&target);

        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let span = tracing::debug_span!(
            parent: &self.span,
            "tunnel",
            goal = %target,
            session_id = %ticket.session_id
        );
        let driver = RoundDriver::new(
            self.store.clone(),
            self.paths.clone(),
            self.poller.clone(),
            self.sessions.clone(),
            target,
            ticket,
            self.timing,
            span,
        );
        tokio::spawn(driver.run(in_rx, out_tx));

        Ok((TunnelReader { rx: out_rx }, TunnelWriter { tx: in_tx }))
    }
}
