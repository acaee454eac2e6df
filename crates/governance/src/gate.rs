//! IPC security gate.
//!
//! Every inbound command passes, in order: payload size ceiling, content
//! pattern filter, then session existence/expiry, permission and rate limit.
//! The first failing check rejects the command.

use regex::{Regex, RegexBuilder};
use std::sync::Arc;

use neural_bridge_core::config::SecurityConfig;
use neural_bridge_core::{
    Error, EventEmitter, EventEnvelope, NoOpEventEmitter, Result, SecurityError,
};

use crate::audit::{AuditEntry, AuditStore, InMemoryAuditStore};
use crate::metrics::track_security_decision;
use crate::sessions::{Session, SessionManager};

pub struct SecurityGate {
    max_payload_bytes: usize,
    patterns: Vec<(String, Regex)>,
    sessions: Arc<SessionManager>,
    audit: Arc<dyn AuditStore>,
    events: Arc<dyn EventEmitter>,
}

impl SecurityGate {
    /// Compile the configured patterns (case-insensitive).
    pub fn new(config: &SecurityConfig, sessions: Arc<SessionManager>) -> Result<Self> {
        let patterns = config
            .blocked_patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (p.clone(), re))
                    .map_err(|e| Error::config(format!("invalid blocked pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            max_payload_bytes: config.max_payload_bytes,
            patterns,
            sessions,
            audit: Arc::new(InMemoryAuditStore::new()),
            events: Arc::new(NoOpEventEmitter),
        })
    }

    pub fn with_audit_store(mut self, audit: Arc<dyn AuditStore>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.events = emitter;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn audit_store(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    fn check_payload(&self, payload: &str) -> std::result::Result<(), SecurityError> {
        if payload.len() > self.max_payload_bytes {
            return Err(SecurityError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }
        if let Some((pattern, _)) = self.patterns.iter().find(|(_, re)| re.is_match(payload)) {
            return Err(SecurityError::MaliciousPayload {
                pattern: pattern.clone(),
            });
        }
        Ok(())
    }

    /// Authorize `command` for the session behind `token`.
    ///
    /// `payload` is the serialized command payload. It is inspected but never
    /// logged or stored.
    pub async fn authorize(
        &self,
        token: &str,
        command: &str,
        payload: &str,
    ) -> std::result::Result<Session, SecurityError> {
        let decision = self
            .check_payload(payload)
            .and_then(|()| self.sessions.authorize_command(token, command));

        match &decision {
            Ok(session) => {
                tracing::info!(
                    session_id = %session.id,
                    command = %command,
                    decision = "accept",
                    payload_bytes = payload.len(),
                    "Security decision"
                );
                self.record(AuditEntry::accepted(&session.id, command)).await;
                self.events
                    .emit(EventEnvelope::security_decision(Some(&session.id), command, None))
                    .await;
                track_security_decision("accept", "ok");
            }
            Err(rejection) => {
                let session_id = self.sessions.session_id_for(token);
                if let SecurityError::MaliciousPayload { pattern } = rejection {
                    tracing::debug!(pattern = %pattern, "Blocked pattern matched");
                }
                tracing::warn!(
                    session_id = session_id.as_deref().unwrap_or("-"),
                    command = %command,
                    decision = "reject",
                    reason = rejection.reason(),
                    payload_bytes = payload.len(),
                    "Security decision"
                );
                self.record(AuditEntry::rejected(
                    session_id.clone(),
                    command,
                    rejection.kind(),
                    rejection.reason(),
                ))
                .await;
                self.events
                    .emit(EventEnvelope::security_decision(
                        session_id.as_deref(),
                        command,
                        Some((rejection.kind(), rejection.reason())),
                    ))
                    .await;
                track_security_decision("reject", rejection.reason());
            }
        }
        decision
    }

    async fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.log(entry).await {
            tracing::error!(error = %e, "Failed to write audit entry");
        }
    }
}
