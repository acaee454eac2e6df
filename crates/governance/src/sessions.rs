//! Session issuance, expiry and per-session command authorization.
//!
//! Tokens are 256-bit random values handed to the caller once; the table is
//! keyed by their SHA-256 digest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use secrecy::Secret;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use neural_bridge_core::config::SecurityConfig;
use neural_bridge_core::{
    EventEmitter, EventEnvelope, EventType, NoOpEventEmitter, SecurityError,
};

use crate::rate_limit::{RateDecision, RateLimitPolicy, SlidingWindow};

/// Public view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub permissions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn permits(&self, command: &str) -> bool {
        self.permissions.contains(command)
    }
}

/// Counters for the session table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    /// (session, command class) windows holding at least one recent request.
    pub rate_limit_windows: usize,
    /// Requests counted against a window right now, across all sessions.
    pub requests_in_window: usize,
}

/// Called for every session the pruner removes.
#[async_trait]
pub trait SessionExpiryHook: Send + Sync {
    async fn on_session_expired(&self, session: &Session);
}

/// A freshly created session together with its bearer token.
#[derive(Debug)]
pub struct IssuedSession {
    pub token: Secret<String>,
    pub session: Session,
}

struct SessionState {
    session: Session,
    created: Instant,
    last_seen: Instant,
    windows: HashMap<String, SlidingWindow>,
}

impl SessionState {
    fn is_expired(&self, ttl: Duration, idle: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= ttl
            || now.saturating_duration_since(self.last_seen) >= idle
    }
}

pub struct SessionManager {
    sessions: DashMap<String, SessionState>,
    ttl: Duration,
    idle_timeout: Duration,
    default_permissions: Vec<String>,
    limits: RateLimitPolicy,
    events: Arc<dyn EventEmitter>,
    expiry_hook: Option<Arc<dyn SessionExpiryHook>>,
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl SessionManager {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl: Duration::from_secs(config.session_ttl_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            default_permissions: config.default_permissions.clone(),
            limits: RateLimitPolicy::new(config.rate_limit.clone()),
            events: Arc::new(NoOpEventEmitter),
            expiry_hook: None,
        }
    }

    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.events = emitter;
        self
    }

    /// Run `hook` for each session removed by [`Self::prune_and_release`].
    pub fn with_expiry_hook(mut self, hook: Arc<dyn SessionExpiryHook>) -> Self {
        self.expiry_hook = Some(hook);
        self
    }

    /// Issue a session with exactly `permissions`.
    pub async fn create_session<I, S>(&self, permissions: I) -> IssuedSession
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let token = generate_token();
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            permissions: permissions.into_iter().map(Into::into).collect(),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(1)),
        };
        let instant = Instant::now();
        self.sessions.insert(
            digest(&token),
            SessionState {
                session: session.clone(),
                created: instant,
                last_seen: instant,
                windows: HashMap::new(),
            },
        );

        tracing::info!(
            session_id = %session.id,
            permissions = ?session.permissions,
            "Session created"
        );
        metrics::gauge!("nb_sessions_active").set(self.sessions.len() as f64);
        self.events
            .emit(
                EventEnvelope::new(
                    EventType::SessionCreated,
                    json!({ "permissions": session.permissions }),
                )
                .with_session(&session.id)
                .with_actor("session-manager"),
            )
            .await;

        IssuedSession {
            token: Secret::new(token),
            session,
        }
    }

    /// Issue a session with the configured default permissions.
    pub async fn create_default_session(&self) -> IssuedSession {
        self.create_session(self.default_permissions.clone()).await
    }

    /// Remove a session. Returns it if it existed.
    pub async fn revoke_session(&self, token: &str) -> Option<Session> {
        let (_, state) = self.sessions.remove(&digest(token))?;
        tracing::info!(session_id = %state.session.id, "Session revoked");
        metrics::gauge!("nb_sessions_active").set(self.sessions.len() as f64);
        self.events
            .emit(
                EventEnvelope::new(EventType::SessionRevoked, json!({ "reason": "revoked" }))
                    .with_session(&state.session.id)
                    .with_actor("session-manager"),
            )
            .await;
        Some(state.session)
    }

    /// Replace the permissions of the session with id `session_id`.
    /// Returns the updated session, or `None` if no such session exists.
    pub fn update_session_permissions<I, S>(&self, session_id: &str, permissions: I) -> Option<Session>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entry = self
            .sessions
            .iter_mut()
            .find(|entry| entry.value().session.id == session_id)?;
        let state = entry.value_mut();
        state.session.permissions = permissions.into_iter().map(Into::into).collect();
        tracing::info!(
            session_id = %session_id,
            permissions = ?state.session.permissions,
            "Session permissions updated"
        );
        Some(state.session.clone())
    }

    /// Drop every expired session and return the removed sessions.
    pub fn prune_expired(&self) -> Vec<Session> {
        let now = Instant::now();
        let mut pruned = Vec::new();
        self.sessions.retain(|_, state| {
            let expired = state.is_expired(self.ttl, self.idle_timeout, now);
            if expired {
                pruned.push(state.session.clone());
            }
            !expired
        });
        if !pruned.is_empty() {
            tracing::info!(pruned = pruned.len(), remaining = self.sessions.len(), "Expired sessions pruned");
            metrics::gauge!("nb_sessions_active").set(self.sessions.len() as f64);
        }
        pruned
    }

    /// Prune expired sessions, then announce each one and run the expiry
    /// hook for it. Returns how many were removed.
    pub async fn prune_and_release(&self) -> usize {
        let pruned = self.prune_expired();
        for session in &pruned {
            self.events
                .emit(
                    EventEnvelope::new(EventType::SessionRevoked, json!({ "reason": "expired" }))
                        .with_session(&session.id)
                        .with_actor("session-manager"),
                )
                .await;
            if let Some(hook) = &self.expiry_hook {
                hook.on_session_expired(session).await;
            }
        }
        pruned.len()
    }

    /// Run `prune_and_release` every `every` until the handle is aborted.
    pub fn spawn_pruner(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.prune_and_release().await;
            }
        })
    }

    /// Session existence, expiry, permission and rate limit, in that order.
    ///
    /// The whole check runs under the session's entry lock, so concurrent
    /// requests cannot overshoot the rate limit. Only admitted requests count
    /// against it and refresh the idle timer.
    pub fn authorize_command(&self, token: &str, command: &str) -> Result<Session, SecurityError> {
        let now = Instant::now();
        let mut entry = self
            .sessions
            .get_mut(&digest(token))
            .ok_or(SecurityError::UnknownSession)?;
        let state = entry.value_mut();

        if state.is_expired(self.ttl, self.idle_timeout, now) {
            return Err(SecurityError::SessionExpired);
        }
        if !state.session.permits(command) {
            return Err(SecurityError::PermissionDenied {
                command: command.to_string(),
            });
        }

        let class = self.limits.class_of(command);
        let rule = self.limits.rule_for(class);
        let decision = state
            .windows
            .entry(class.to_string())
            .or_default()
            .try_acquire(rule, now);
        if let RateDecision::Limited { retry_after } = decision {
            return Err(SecurityError::RateLimited {
                command_class: class.to_string(),
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        state.last_seen = now;
        Ok(state.session.clone())
    }

    /// Session id for a token, without any checks. Used to attribute audit records.
    pub fn session_id_for(&self, token: &str) -> Option<String> {
        self.sessions
            .get(&digest(token))
            .map(|state| state.session.id.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> SessionStats {
        let now = Instant::now();
        let mut stats = SessionStats {
            active_sessions: self.sessions.len(),
            ..SessionStats::default()
        };
        for entry in self.sessions.iter() {
            for (class, window) in &entry.value().windows {
                let recent = window.count_within(self.limits.rule_for(class).window(), now);
                if recent > 0 {
                    stats.rate_limit_windows += 1;
                    stats.requests_in_window += recent;
                }
            }
        }
        stats
    }
}
