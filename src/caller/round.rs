//! Round state machine for one tunnelled connection.
//!
//! # Data Flow
//! ```text
//!  AwaitingFirstRound ──first bytes / EOF──▶ AwaitingResponse
//!        AwaitingResponse ──response, keep-alive──▶ DrainingForNextRound
//!        AwaitingResponse ──response, one-shot / error / timeout──▶ Closed
//!  DrainingForNextRound ──buffered bytes on tick──▶ AwaitingResponse (new id)
//!  DrainingForNextRound ──wait elapsed / EOF with empty buffer──▶ Closed
//! ```
//!
//! # Design Decisions
//! - One task owns the state, the composer and the poll future, so the
//!   "response seen" transition and later writes cannot race
//! - The state moves to `DrainingForNextRound` before response bytes are
//!   handed to the reader; bytes the client sends in reaction are
//!   buffered for the next round, never appended to the finished one
//! - Buffered bytes are released on the next check tick, which coalesces
//!   a burst of small writes into one chunk
//! - A dropped reader cancels everything, including an in-flight poll

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future::OptionFuture;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::caller::composer::RequestComposer;
use crate::caller::error::TunnelError;
use crate::caller::poller::{PollOutcome, ResponsePoller};
use crate::caller::sessions::{CallerSessionRegistry, SessionTicket};
use crate::observability::metrics;
use crate::protocol::{PathScheme, RequestMetadata, Target};
use crate::storage::SharedStore;

type PollFuture = Pin<Box<dyn Future<Output = Result<PollOutcome, TunnelError>> + Send>>;

/// Where the connection is in its sequence of rounds.
pub enum RoundState {
    AwaitingFirstRound,
    AwaitingResponse { composer: RequestComposer },
    DrainingForNextRound { buffer: BytesMut, deadline: Instant },
    Closed,
}

impl RoundState {
    pub fn name(&self) -> &'static str {
        match self {
            RoundState::AwaitingFirstRound => "awaiting_first_round",
            RoundState::AwaitingResponse { .. } => "awaiting_response",
            RoundState::DrainingForNextRound { .. } => "draining_for_next_round",
            RoundState::Closed => "closed",
        }
    }
}

/// Timing knobs for the post-response wait.
#[derive(Debug, Clone, Copy)]
pub struct RoundTiming {
    pub next_round_wait: Duration,
    pub next_round_check: Duration,
}

pub struct RoundDriver {
    store: SharedStore,
    paths: PathScheme,
    poller: ResponsePoller,
    sessions: Arc<CallerSessionRegistry>,
    target: Target,
    ticket: SessionTicket,
    timing: RoundTiming,
    state: RoundState,
    rounds: u32,
    input_open: bool,
    span: Span,
}

impl RoundDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SharedStore,
        paths: PathScheme,
        poller: ResponsePoller,
        sessions: Arc<CallerSessionRegistry>,
        target: Target,
        ticket: SessionTicket,
        timing: RoundTiming,
        span: Span,
    ) -> Self {
        Self {
            store,
            paths,
            poller,
            sessions,
            target,
            ticket,
            timing,
            state: RoundState::AwaitingFirstRound,
            rounds: 0,
            input_open: true,
            span,
        }
    }

    /// Drive the connection until it closes.
    ///
    /// `input` carries bytes written by the client (closed on client EOF);
    /// `output` receives response bytes and at most one terminal error.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Bytes>,
        output: mpsc::Sender<Result<Bytes, TunnelError>>,
    ) {
        let span = self.span.clone();
        async move {
            let mut pending: Option<PollFuture> = None;
            let mut ticker = tokio::time::interval(self.timing.next_round_check);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while !matches!(self.state, RoundState::Closed) {
                let draining = matches!(self.state, RoundState::DrainingForNextRound { .. });
                let input_open = self.input_open;

                let step = tokio::select! {
                    _ = output.closed() => {
                        tracing::debug!(state = self.state.name(), "Reader dropped; cancelling");
                        self.state = RoundState::Closed;
                        Ok(())
                    }
                    chunk = input.recv(), if input_open => match chunk {
                        Some(bytes) => self.on_data(bytes, &mut pending).await,
                        None => {
                            self.input_open = false;
                            self.on_eof(&mut pending).await
                        }
                    },
                    Some(outcome) = OptionFuture::from(pending.as_mut()), if pending.is_some() => {
                        pending = None;
                        self.on_outcome(outcome, &output).await;
                        Ok(())
                    }
                    _ = ticker.tick(), if draining => self.on_tick(&mut pending).await,
                };

                if let Err(e) = step {
                    tracing::warn!(error = %e, state = self.state.name(), "Round failed");
                    metrics::record_round("caller", "store_error");
                    let _ = output.send(Err(e)).await;
                    self.state = RoundState::Closed;
                }
            }

            if self.ticket.pooled {
                self.sessions.close_session(&self.ticket.session_id);
            }
            tracing::debug!(rounds = self.rounds, "Tunnel closed");
        }
        .instrument(span)
        .await
    }

    async fn on_data(&mut self, bytes: Bytes, pending: &mut Option<PollFuture>) -> Result<(), TunnelError> {
        match &mut self.state {
            RoundState::AwaitingFirstRound => {
                let composer = self.open_round(bytes).await?;
                *pending = Some(self.start_poll(&composer));
                self.state = RoundState::AwaitingResponse { composer };
            }
            RoundState::AwaitingResponse { composer } => {
                composer.write(bytes).await?;
            }
            RoundState::DrainingForNextRound { buffer, .. } => {
                buffer.extend_from_slice(&bytes);
            }
            RoundState::Closed => {}
        }
        Ok(())
    }

    async fn on_eof(&mut self, pending: &mut Option<PollFuture>) -> Result<(), TunnelError> {
        match &mut self.state {
            RoundState::AwaitingFirstRound => {
                let composer = self.open_round(Bytes::new()).await?;
                *pending = Some(self.start_poll(&composer));
                self.state = RoundState::AwaitingResponse { composer };
            }
            RoundState::AwaitingResponse { composer } => {
                composer.finish().await?;
            }
            RoundState::DrainingForNextRound { buffer, .. } if buffer.is_empty() => {
                self.state = RoundState::Closed;
            }
            // Buffered bytes are still sent on the next tick.
            RoundState::DrainingForNextRound { .. } | RoundState::Closed => {}
        }
        Ok(())
    }

    async fn on_tick(&mut self, pending: &mut Option<PollFuture>) -> Result<(), TunnelError> {
        let RoundState::DrainingForNextRound { buffer, deadline } = &mut self.state else {
            return Ok(());
        };

        if !buffer.is_empty() {
            let data = buffer.split().freeze();
            let composer = self.open_round(data).await?;
            *pending = Some(self.start_poll(&composer));
            self.state = RoundState::AwaitingResponse { composer };
        } else if Instant::now() >= *deadline {
            tracing::debug!(rounds = self.rounds, "No further data after response");
            self.state = RoundState::Closed;
        }
        Ok(())
    }

    async fn on_outcome(
        &mut self,
        outcome: Result<PollOutcome, TunnelError>,
        output: &mpsc::Sender<Result<Bytes, TunnelError>>,
    ) {
        let request_id = match &self.state {
            RoundState::AwaitingResponse { composer } => composer.request_id().to_string(),
            _ => String::new(),
        };

        match outcome {
            Ok(PollOutcome::Response(bytes)) => {
                metrics::record_round("caller", "response");
                // Transition first: anything the client sends from here on
                // belongs to the next round.
                self.state = if self.ticket.pooled && self.input_open {
                    RoundState::DrainingForNextRound {
                        buffer: BytesMut::new(),
                        deadline: Instant::now() + self.timing.next_round_wait,
                    }
                } else {
                    RoundState::Closed
                };
                if !bytes.is_empty() && output.send(Ok(bytes)).await.is_err() {
                    self.state = RoundState::Closed;
                }
            }
            Ok(PollOutcome::Remote(error)) => {
                metrics::record_round("caller", "remote_error");
                tracing::warn!(%request_id, code = %error.code, error = %error.error, "Round failed remotely");
                let _ = output
                    .send(Err(TunnelError::Remote { code: error.code, message: error.error }))
                    .await;
                self.state = RoundState::Closed;
            }
            Ok(PollOutcome::TimedOut) => {
                metrics::record_round("caller", "timeout");
                let timeout = self.poller.response_timeout();
                let _ = output.send(Err(TunnelError::Timeout { request_id, timeout })).await;
                self.state = RoundState::Closed;
            }
            Err(e) => {
                metrics::record_round("caller", "store_error");
                let _ = output.send(Err(e)).await;
                self.state = RoundState::Closed;
            }
        }
    }

    /// Mint a request id, publish its first chunk (or an empty round).
    async fn open_round(&mut self, first: Bytes) -> Result<RequestComposer, TunnelError> {
        let request_id = Uuid::new_v4().to_string();
        let mut metadata = RequestMetadata::new(request_id.clone(), &self.target);
        if self.ticket.pooled {
            let is_first = self.rounds == 0 && self.ticket.is_first_in_session;
            metadata = metadata.with_session(self.ticket.session_id.clone(), is_first);
            self.sessions.record_request(&self.ticket.session_id, &request_id);
        }
        self.rounds += 1;

        tracing::debug!(%request_id, round = self.rounds, goal = %self.target, "Opening round");

        let mut composer = RequestComposer::new(self.store.clone(), self.paths.clone(), metadata);
        if first.is_empty() {
            composer.finish().await?;
        } else {
            composer.write(first).await?;
        }
        Ok(composer)
    }

    fn start_poll(&self, composer: &RequestComposer) -> PollFuture {
        let poller = self.poller.clone();
        let request_id = composer.request_id().to_string();
        Box::pin(async move { poller.poll(&request_id).await })
    }
}
