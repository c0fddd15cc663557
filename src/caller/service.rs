//! CALLER process wiring: SOCKS5 accept loop plus the session sweeper.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::Instrument;

use crate::caller::connector::TunnelConnector;
use crate::caller::sessions::CallerSessionRegistry;
use crate::caller::socks5::{self, RelayStats, Reply, Socks5Error};
use crate::config::TunnelConfig;
use crate::lifecycle::Shutdown;
use crate::net::{BoundedListener, ListenerError};
use crate::observability::logging::component_span;
use crate::storage::SharedStore;

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

pub struct CallerService {
    listener: BoundedListener,
    connector: TunnelConnector,
    sweep_interval: Duration,
}

impl CallerService {
    pub async fn bind(config: &TunnelConfig, store: SharedStore) -> Result<Self, ListenerError> {
        let listener = BoundedListener::bind(&config.caller.bind_address, config.caller.max_connections).await?;
        let registry = Arc::new(CallerSessionRegistry::new(
            &config.sessions,
            component_span("caller", "session_registry"),
        ));
        let connector = TunnelConnector::new(
            store,
            &config.protocol,
            &config.sessions,
            registry,
            component_span("caller", "connector"),
        );
        Ok(Self {
            listener,
            connector,
            sweep_interval: config.sessions.sweep_interval(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connector(&self) -> &TunnelConnector {
        &self.connector
    }

    /// Accept SOCKS5 clients until shutdown.
    pub async fn run(self, shutdown: Shutdown) {
        let sweeper = tokio::spawn(
            self.connector
                .sessions()
                .clone()
                .run_sweeper(self.sweep_interval, shutdown.subscribe()),
        );
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown_rx.recv() => break,
            };

            match accepted {
                Ok((stream, peer, permit)) => {
                    let connector = self.connector.clone();
                    let span = tracing::debug_span!("socks_client", peer = %peer);
                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            match handle_client(stream, &connector).await {
                                Ok(stats) => tracing::debug!(
                                    sent = stats.client_to_tunnel,
                                    received = stats.tunnel_to_client,
                                    "Client finished"
                                ),
                                Err(e) => tracing::debug!(error = %e, "Client rejected"),
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(ListenerError::LimiterClosed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
        }

        tracing::info!("CALLER stopped accepting");
        let _ = sweeper.await;
    }
}

async fn handle_client(mut stream: TcpStream, connector: &TunnelConnector) -> Result<RelayStats, Socks5Error> {
    let target = socks5::negotiate(&mut stream).await?;

    let (reader, writer) = match connector.connect(&target.address, target.port) {
        Ok(halves) => halves,
        Err(e) => {
            tracing::warn!(goal = %target, error = %e, "Tunnel connect failed");
            socks5::send_reply(&mut stream, Reply::for_error(&e)).await?;
            return Err(Socks5Error::Tunnel(e));
        }
    };
    socks5::send_reply(&mut stream, Reply::Succeeded).await?;
    disable_coalescing(&stream);

    tracing::debug!(goal = %target, "Tunnel open");
    Ok(socks5::relay(stream, reader, writer).await)
}

/// Relay traffic is latency-bound; a failure here only costs batching.
fn disable_coalescing(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY on client socket");
    }
}
