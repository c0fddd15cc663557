//! LISTENER process wiring: monitor → bounded processor pool, plus the
//! session sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::TunnelConfig;
use crate::lifecycle::Shutdown;
use crate::listener::monitor::{KnownRequests, RequestMonitor};
use crate::listener::processor::{ProcessorSettings, RequestProcessor};
use crate::listener::sessions::ListenerSessionRegistry;
use crate::observability::logging::component_span;
use crate::protocol::PathScheme;
use crate::storage::SharedStore;

const DISCOVERY_BUFFER: usize = 256;

pub struct ListenerService {
    monitor: RequestMonitor,
    processor: Arc<RequestProcessor>,
    sessions: Arc<ListenerSessionRegistry>,
    sweep_interval: Duration,
    max_concurrent: usize,
}

impl ListenerService {
    pub fn new(config: &TunnelConfig, store: SharedStore) -> Self {
        let known = KnownRequests::new();
        let sessions = Arc::new(ListenerSessionRegistry::new(
            config.protocol.connection_timeout(),
            config.sessions.idle_timeout(),
            config.listener.max_buffered_bytes,
            component_span("listener", "session_registry"),
        ));
        let monitor = RequestMonitor::new(
            store.clone(),
            &config.protocol,
            known.clone(),
            component_span("listener", "monitor"),
        );
        let processor = Arc::new(RequestProcessor::new(
            store,
            PathScheme::from_config(&config.protocol),
            ProcessorSettings::from_config(&config.protocol, &config.sessions, &config.listener),
            sessions.clone(),
            known,
            component_span("listener", "processor"),
        ));

        Self {
            monitor,
            processor,
            sessions,
            sweep_interval: config.sessions.sweep_interval(),
            max_concurrent: config.listener.max_concurrent_requests,
        }
    }

    pub fn sessions(&self) -> &Arc<ListenerSessionRegistry> {
        &self.sessions
    }

    /// Poll and serve rounds until shutdown. In-flight rounds are allowed
    /// to finish before returning.
    pub async fn run(self, shutdown: Shutdown) {
        let (tx, mut discovered) = mpsc::channel::<String>(DISCOVERY_BUFFER);
        let monitor = tokio::spawn(self.monitor.run(tx, shutdown.subscribe()));
        let sweeper = tokio::spawn(
            self.sessions
                .clone()
                .run_sweeper(self.sweep_interval, shutdown.subscribe()),
        );

        let limiter = Arc::new(Semaphore::new(self.max_concurrent));
        let mut rounds = JoinSet::new();
        let mut shutdown_rx = shutdown.subscribe();
        tracing::info!(max_concurrent = self.max_concurrent, "LISTENER started");

        loop {
            let request_id = tokio::select! {
                next = discovered.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            };

            let permit = match limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let processor = self.processor.clone();
            rounds.spawn(
                async move {
                    let _permit = permit;
                    let outcome = processor.process(&request_id).await;
                    tracing::debug!(request_id = %request_id, outcome = ?outcome, "Round finished");
                }
                .in_current_span(),
            );

            // Reap finished rounds so the set does not grow without bound.
            while rounds.try_join_next().is_some() {}
        }

        tracing::info!(in_flight = rounds.len(), "LISTENER draining in-flight rounds");
        while rounds.join_next().await.is_some() {}
        let _ = monitor.await;
        let _ = sweeper.await;
        tracing::info!("LISTENER stopped");
    }
}
