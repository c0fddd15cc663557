//! LISTENER-side session registry.
//!
//! # Responsibilities
//! - Open the real TCP socket on a session's first round
//! - Keep it alive across rounds and drain it between them
//! - Evict idle or dead sessions
//!
//! # Design Decisions
//! - Each session is an actor task that owns its `TcpStream` outright.
//!   Rounds talk to it over a command channel, so a foreground exchange
//!   and the background drain can never read the socket at the same time
//! - Draining is a mode of the actor loop, switched on by
//!   `ResumeDraining` and off by the next `Exchange`
//! - Bytes drained between rounds are prepended to the next round's
//!   response, so nothing the GOAL sends is lost
//! - The drain buffer is capped; a GOAL that overruns it while nobody
//!   collects is cut off and the session left for the sweeper
//! - Liveness is published on a `watch` channel rather than a shared flag
//! - A non-first round for an unknown session is an error, not a reconnect

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{Instrument, Span};

use crate::listener::dial::dial;
use crate::listener::reader::{read_response, ReadOutcome, ReadPolicy};
use crate::observability::metrics;
use crate::protocol::{ErrorCode, Target};

const SIDE: &str = "listener";
const COMMAND_CAPACITY: usize = 8;
const DRAIN_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} is closed")]
    Closed(String),

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("session io failed: {0}")]
    Io(#[source] io::Error),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound(_) => ErrorCode::InvalidRequest,
            SessionError::Closed(_) => ErrorCode::ConnectionError,
            SessionError::Connect(e) | SessionError::Io(e) => ErrorCode::from_io(e),
        }
    }
}

/// Published state of a session actor.
#[derive(Debug, Clone, Copy)]
pub struct SessionStatus {
    pub last_activity: Instant,
    /// Socket still usable.
    pub open: bool,
    /// Background drain active.
    pub draining: bool,
    pub buffered: usize,
}

enum SessionCommand {
    Exchange {
        payload: Bytes,
        policy: ReadPolicy,
        reply: oneshot::Sender<io::Result<ReadOutcome>>,
    },
    ResumeDraining,
    TakeBuffered {
        reply: oneshot::Sender<Bytes>,
    },
    Close,
}

/// Cheap handle to a session actor.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    session_id: String,
    target: Target,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Whether the actor is running and its socket usable.
    pub fn is_open(&self) -> bool {
        !self.commands.is_closed() && self.status.borrow().open
    }

    /// Write `payload` and read one response. Stops any background drain
    /// first; drained bytes lead the returned data.
    pub async fn exchange(&self, payload: Bytes, policy: ReadPolicy) -> Result<ReadOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Exchange { payload, policy, reply }).await?;
        rx.await
            .map_err(|_| SessionError::Closed(self.session_id.clone()))?
            .map_err(SessionError::Io)
    }

    /// Start draining the socket in the background. Idempotent.
    pub async fn start_continuous_reading(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::ResumeDraining).await
    }

    /// Take everything drained so far, leaving the buffer empty.
    pub async fn take_buffered(&self) -> Result<Bytes, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::TakeBuffered { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed(self.session_id.clone()))
    }

    /// Ask the actor to close the socket and exit.
    pub fn close(&self) {
        let _ = self.commands.try_send(SessionCommand::Close);
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed(self.session_id.clone()))
    }
}

/// Spawn the actor for an already connected socket.
fn spawn_session(
    session_id: &str,
    target: &Target,
    stream: TcpStream,
    max_buffered: usize,
    span: Span,
) -> SessionHandle {
    let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
    let (status_tx, status) = watch::channel(SessionStatus {
        last_activity: Instant::now(),
        open: true,
        draining: false,
        buffered: 0,
    });
    let actor_span = tracing::debug_span!(parent: &span, "session", session_id, goal = %target);
    tokio::spawn(run_session(stream, rx, status_tx, max_buffered).instrument(actor_span));

    SessionHandle {
        session_id: session_id.to_string(),
        target: target.clone(),
        commands,
        status,
    }
}

async fn run_session(
    mut stream: TcpStream,
    mut commands: mpsc::Receiver<SessionCommand>,
    status: watch::Sender<SessionStatus>,
    max_buffered: usize,
) {
    let mut buffer = BytesMut::new();
    let mut open = true;
    let mut draining = false;

    let publish = |open: bool, draining: bool, buffered: usize, touched: bool| {
        status.send_modify(|s| {
            s.open = open;
            s.draining = draining;
            s.buffered = buffered;
            if touched {
                s.last_activity = Instant::now();
            }
        });
    };

    loop {
        if draining {
            buffer.reserve(DRAIN_CHUNK);
        }

        tokio::select! {
            command = commands.recv() => match command {
                None | Some(SessionCommand::Close) => break,
                Some(SessionCommand::Exchange { payload, policy, reply }) => {
                    draining = false;
                    let result = exchange(&mut stream, &mut buffer, open, payload, policy).await;
                    if result.as_ref().map_or(true, |o| o.closed) {
                        open = false;
                    }
                    publish(open, draining, buffer.len(), true);
                    let _ = reply.send(result);
                }
                Some(SessionCommand::ResumeDraining) => {
                    draining = open;
                    publish(open, draining, buffer.len(), true);
                }
                Some(SessionCommand::TakeBuffered { reply }) => {
                    let _ = reply.send(buffer.split().freeze());
                    publish(open, draining, 0, false);
                }
            },
            read = stream.read_buf(&mut buffer), if draining => match read {
                Ok(0) => {
                    tracing::debug!(buffered = buffer.len(), "GOAL closed while draining");
                    open = false;
                    draining = false;
                    publish(open, draining, buffer.len(), true);
                }
                Ok(n) if buffer.len() > max_buffered => {
                    tracing::warn!(
                        bytes = n,
                        buffered = buffer.len(),
                        limit = max_buffered,
                        "Drain buffer overflow; dropping session"
                    );
                    metrics::record_session_event(SIDE, "overflow");
                    buffer.clear();
                    break;
                }
                Ok(n) => {
                    tracing::trace!(bytes = n, buffered = buffer.len(), "Drained");
                    publish(open, draining, buffer.len(), true);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Drain failed; session socket unusable");
                    open = false;
                    draining = false;
                    publish(open, draining, buffer.len(), true);
                }
            },
        }
    }

    let _ = stream.shutdown().await;
    status.send_modify(|s| {
        s.open = false;
        s.draining = false;
        s.buffered = buffer.len();
    });
    tracing::debug!("Session actor stopped");
}

async fn exchange(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    open: bool,
    payload: Bytes,
    policy: ReadPolicy,
) -> io::Result<ReadOutcome> {
    let drained = buffer.split().freeze();
    let with_drained = |outcome: ReadOutcome| {
        if drained.is_empty() {
            return outcome;
        }
        let mut data = BytesMut::with_capacity(drained.len() + outcome.data.len());
        data.extend_from_slice(&drained);
        data.extend_from_slice(&outcome.data);
        ReadOutcome { data: data.freeze(), closed: outcome.closed }
    };

    if !open {
        if drained.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session socket closed"));
        }
        return Ok(with_drained(ReadOutcome { data: Bytes::new(), closed: true }));
    }

    if !payload.is_empty() {
        if let Err(e) = stream.write_all(&payload).await {
            if drained.is_empty() {
                return Err(e);
            }
            return Ok(with_drained(ReadOutcome { data: Bytes::new(), closed: true }));
        }
    }

    match read_response(stream, policy).await {
        Ok(outcome) => Ok(with_drained(outcome)),
        Err(_) if !drained.is_empty() => Ok(with_drained(ReadOutcome { data: Bytes::new(), closed: true })),
        Err(e) => Err(e),
    }
}

/// Owns every live session socket on the LISTENER.
pub struct ListenerSessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    connect_timeout: Duration,
    idle_timeout: Duration,
    max_buffered: usize,
    span: Span,
}

impl ListenerSessionRegistry {
    pub fn new(connect_timeout: Duration, idle_timeout: Duration, max_buffered: usize, span: Span) -> Self {
        Self {
            sessions: DashMap::new(),
            connect_timeout,
            idle_timeout,
            max_buffered,
            span,
        }
    }

    /// Session for `session_id`, connecting to `target` on its first round.
    ///
    /// A first round that finds a live entry reuses it (duplicate delivery).
    /// A first round that finds a dead entry replaces it.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        target: &Target,
        is_first: bool,
    ) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.sessions.get(session_id).map(|h| h.clone()) {
            if handle.is_open() || !is_first {
                return Ok(handle);
            }
        } else if !is_first {
            self.span.in_scope(|| {
                tracing::error!(session_id, goal = %target, "Continuation round for unknown session");
            });
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        let stream = dial(target, self.connect_timeout)
            .instrument(self.span.clone())
            .await
            .map_err(SessionError::Connect)?;
        let fresh = spawn_session(session_id, target, stream, self.max_buffered, self.span.clone());

        let handle = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) if !entry.get().is_open() => {
                entry.get().close();
                entry.insert(fresh.clone());
                fresh
            }
            Entry::Occupied(entry) => {
                // Lost a race with a concurrent first round.
                fresh.close();
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh.clone());
                fresh
            }
        };

        metrics::record_session_event(SIDE, "created");
        metrics::record_active_sessions(SIDE, self.sessions.len());
        self.span.in_scope(|| tracing::info!(session_id, goal = %target, "Session opened"));
        Ok(handle)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.get(session_id).map(|h| h.clone())
    }

    pub async fn start_continuous_reading(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        handle.start_continuous_reading().await
    }

    /// Drain and return the bytes buffered since the last round.
    pub async fn buffered_data(&self, session_id: &str) -> Result<Bytes, SessionError> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        handle.take_buffered().await
    }

    pub fn close(&self, session_id: &str) {
        if let Some((_, handle)) = self.sessions.remove(session_id) {
            handle.close();
            metrics::record_session_event(SIDE, "closed");
            metrics::record_active_sessions(SIDE, self.sessions.len());
            self.span.in_scope(|| tracing::debug!(session_id, "Session closed"));
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    /// Evict sessions idle since before `now - idle_timeout`, and sessions
    /// whose socket is gone and has nothing left to deliver.
    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let idle_timeout = self.idle_timeout;
        let evictable = |handle: &SessionHandle| {
            let status = handle.status();
            let idle = now.saturating_duration_since(status.last_activity) >= idle_timeout;
            let dead = !handle.is_open() && status.buffered == 0;
            idle || dead
        };

        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| evictable(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reclaimed = 0;
        for session_id in expired {
            if let Some((_, handle)) = self.sessions.remove_if(&session_id, |_, h| evictable(h)) {
                handle.close();
                reclaimed += 1;
                metrics::record_session_event(SIDE, "evicted");
            }
        }

        if reclaimed > 0 {
            metrics::record_active_sessions(SIDE, self.sessions.len());
            self.span.in_scope(|| tracing::info!(reclaimed, "Idle sessions reclaimed"));
        }
        reclaimed
    }

    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_idle();
                }
                _ = shutdown.recv() => break,
            }
        }
        for entry in self.sessions.iter() {
            entry.value().close();
        }
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn policy() -> ReadPolicy {
        ReadPolicy {
            attempt_timeout: Duration::from_millis(50),
            overall_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_millis(500),
        }
    }

    fn registry() -> ListenerSessionRegistry {
        ListenerSessionRegistry::new(Duration::from_secs(1), Duration::from_secs(60), 1024 * 1024, Span::none())
    }

    /// Server that prefixes every read with `>` and counts accepts.
    async fn echo_server() -> (Target, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        let mut reply = b">".to_vec();
                        reply.extend_from_slice(&buf[..n]);
                        if socket.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (Target::new("127.0.0.1", port), accepts)
    }

    #[tokio::test]
    async fn rounds_share_one_socket() {
        let (target, accepts) = echo_server().await;
        let registry = registry();

        let first = registry.get_or_create("s1", &target, true).await.unwrap();
        let out = first.exchange(Bytes::from_static(b"one"), policy()).await.unwrap();
        assert_eq!(&out.data[..], b">one");

        registry.start_continuous_reading("s1").await.unwrap();
        registry.start_continuous_reading("s1").await.unwrap();

        let second = registry.get_or_create("s1", &target, false).await.unwrap();
        let out = second.exchange(Bytes::from_static(b"two"), policy()).await.unwrap();
        assert_eq!(&out.data[..], b">two");
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_continuation_fails_loudly() {
        let (target, accepts) = echo_server().await;
        let registry = registry();

        let err = registry.get_or_create("missing", &target, false).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert_eq!(accepts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bytes_sent_between_rounds_are_kept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::new("127.0.0.1", listener.local_addr().unwrap().port());
        let (push_tx, mut push_rx) = mpsc::channel::<&'static [u8]>(4);
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            while let Some(bytes) = push_rx.recv().await {
                socket.write_all(bytes).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let registry = registry();
        let handle = registry.get_or_create("s2", &target, true).await.unwrap();
        registry.start_continuous_reading("s2").await.unwrap();

        push_tx.send(b"unsolicited").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.status().buffered == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(handle.status().draining);

        push_tx.send(b"+reply").await.unwrap();
        let out = handle.exchange(Bytes::new(), policy()).await.unwrap();
        assert!(out.data.starts_with(b"unsolicited"));
        assert!(!handle.status().draining);
    }

    #[tokio::test]
    async fn buffered_data_drains_the_buffer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"early").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let registry = registry();
        let handle = registry.get_or_create("s3", &target, true).await.unwrap();
        registry.start_continuous_reading("s3").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.status().buffered < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(&registry.buffered_data("s3").await.unwrap()[..], b"early");
        assert!(registry.buffered_data("s3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions() {
        let (target, _) = echo_server().await;
        let registry = registry();
        let handle = registry.get_or_create("s4", &target, true).await.unwrap();

        assert_eq!(registry.sweep_idle(), 0);
        assert_eq!(registry.sweep_idle_at(Instant::now() + Duration::from_secs(61)), 1);
        assert!(registry.is_empty());

        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.is_open() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn drain_overflow_drops_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let chunk = [b'x'; 512];
            while socket.write_all(&chunk).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let registry = ListenerSessionRegistry::new(Duration::from_secs(1), Duration::from_secs(60), 4096, Span::none());
        let handle = registry.get_or_create("s5", &target, true).await.unwrap();
        registry.start_continuous_reading("s5").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.is_open() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.status().buffered, 0);

        // Not idle, but dead with nothing to deliver.
        assert_eq!(registry.sweep_idle(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn drained_bytes_survive_a_closed_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"pending").await.unwrap();
        });

        let registry = registry();
        let handle = registry.get_or_create("s6", &target, true).await.unwrap();
        registry.start_continuous_reading("s6").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.status().open {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.status().buffered, 7);

        // Closed but still holding data, so the sweeper keeps it.
        assert_eq!(registry.sweep_idle(), 0);

        let out = handle.exchange(Bytes::from_static(b"more"), policy()).await.unwrap();
        assert_eq!(&out.data[..], b"pending");
        assert!(out.closed);

        let err = handle.exchange(Bytes::from_static(b"again"), policy()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionError);
        assert_eq!(registry.sweep_idle(), 1);
    }
}
