//! CALLER-side session registry.
//!
//! # Responsibilities
//! - Decide which target ports get multi-round sessions
//! - Map `(address, port)` to a stable session id while the session lives
//! - Reclaim idle sessions and sessions whose tunnel has ended
//!
//! # Design Decisions
//! - Two indexes: `by_target` and `sessions`. When both are touched under
//!   one guard the order is always `by_target` then `sessions`
//! - Non-session ports get a one-shot id that is never stored
//! - Concurrent tunnels to the same session target share one id; the
//!   LISTENER then serves them over one socket

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::Span;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::observability::metrics;
use crate::protocol::Target;

const SIDE: &str = "caller";

/// A logical connection spanning several rounds.
#[derive(Debug, Clone)]
pub struct CallerSession {
    pub session_id: String,
    pub target: Target,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub request_ids: Vec<String>,
}

/// Result of [`CallerSessionRegistry::resolve_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub session_id: String,
    pub is_first_in_session: bool,
    /// Whether the id is tracked by the registry. One-shot tickets are not,
    /// and their rounds carry no session fields.
    pub pooled: bool,
}

pub struct CallerSessionRegistry {
    session_ports: Vec<u16>,
    idle_timeout: Duration,
    by_target: DashMap<Target, String>,
    sessions: DashMap<String, CallerSession>,
    span: Span,
}

impl CallerSessionRegistry {
    pub fn new(config: &SessionConfig, span: Span) -> Self {
        Self {
            session_ports: config.session_ports.clone(),
            idle_timeout: config.idle_timeout(),
            by_target: DashMap::new(),
            sessions: DashMap::new(),
            span,
        }
    }

    pub fn should_use_sessions(&self, port: u16) -> bool {
        self.session_ports.contains(&port)
    }

    /// Find or create the session for `target`.
    pub fn resolve_session(&self, target: &Target) -> SessionTicket {
        if !self.should_use_sessions(target.port) {
            return SessionTicket {
                session_id: Uuid::new_v4().to_string(),
                is_first_in_session: true,
                pooled: false,
            };
        }

        let now = Instant::now();
        let ticket = match self.by_target.entry(target.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().clone();
                if let Some(mut session) = self.sessions.get_mut(&existing) {
                    session.last_activity = now;
                    SessionTicket {
                        session_id: existing,
                        is_first_in_session: false,
                        pooled: true,
                    }
                } else {
                    // Index outlived its session (closed concurrently).
                    let session_id = self.insert_session(target, now);
                    entry.insert(session_id.clone());
                    SessionTicket {
                        session_id,
                        is_first_in_session: true,
                        pooled: true,
                    }
                }
            }
            Entry::Vacant(entry) => {
                let session_id = self.insert_session(target, now);
                entry.insert(session_id.clone());
                SessionTicket {
                    session_id,
                    is_first_in_session: true,
                    pooled: true,
                }
            }
        };

        self.span.in_scope(|| {
            tracing::debug!(
                session_id = %ticket.session_id,
                goal = %target,
                first = ticket.is_first_in_session,
                "Session resolved"
            );
        });
        ticket
    }

    fn insert_session(&self, target: &Target, now: Instant) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            CallerSession {
                session_id: session_id.clone(),
                target: target.clone(),
                created_at: now,
                last_activity: now,
                request_ids: Vec::new(),
            },
        );
        metrics::record_session_event(SIDE, "created");
        metrics::record_active_sessions(SIDE, self.sessions.len());
        session_id
    }

    /// Attach a round to its session and refresh activity.
    pub fn record_request(&self, session_id: &str, request_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_activity = Instant::now();
            session.request_ids.push(request_id.to_string());
        }
    }

    pub fn get(&self, session_id: &str) -> Option<CallerSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop a session from every index. Unknown ids are ignored.
    pub fn close_session(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        self.by_target.remove_if(&session.target, |_, id| id == session_id);

        metrics::record_session_event(SIDE, "closed");
        metrics::record_active_sessions(SIDE, self.sessions.len());
        self.span.in_scope(|| {
            tracing::debug!(
                session_id,
                goal = %session.target,
                rounds = session.request_ids.len(),
                "Session closed"
            );
        });
    }

    /// Reclaim sessions idle for longer than the configured timeout.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    /// Sweep as if the current time were `now`.
    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let expired: Vec<(String, Target)> = self
            .sessions
            .iter()
            .filter(|s| now.saturating_duration_since(s.last_activity) >= self.idle_timeout)
            .map(|s| (s.session_id.clone(), s.target.clone()))
            .collect();

        let mut reclaimed = 0;
        for (session_id, target) in expired {
            // Re-check under the index guard: a concurrent resolve may have
            // refreshed the session since it was collected.
            let still_idle = |id: &String| {
                self.sessions
                    .get(id)
                    .map_or(true, |s| now.saturating_duration_since(s.last_activity) >= self.idle_timeout)
            };
            self.by_target
                .remove_if(&target, |_, id| *id == session_id && still_idle(id));

            if self
                .sessions
                .remove_if(&session_id, |_, s| {
                    now.saturating_duration_since(s.last_activity) >= self.idle_timeout
                })
                .is_some()
            {
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

    /// Sweep on `interval` until shutdown.
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
    }
}
