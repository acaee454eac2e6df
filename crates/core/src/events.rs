use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::types::{ExecutionResult, SandboxInstance};

/// Structured Event Envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: String,
    /// Session the event belongs to (if applicable)
    pub session_id: Option<String>,
    /// Component that produced the event ("supervisor", "security-gate", ...)
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: EventSeverity,
    /// Event-specific data. Never contains task text or payload content.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: None,
            actor: "system".to_string(),
            timestamp: Utc::now(),
            event_type,
            severity: EventSeverity::Info,
            payload,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// `sandbox_created`, `sandbox_stopped`, `sandbox_degraded` and `sandbox_reclaimed`.
    pub fn sandbox(event_type: EventType, instance: &SandboxInstance, reason: Option<&str>) -> Self {
        let payload = SandboxEventPayload {
            sandbox_id: instance.id.to_string(),
            tool: instance.tool_kind.as_str().to_string(),
            port: instance.assigned_port,
            status: format!("{:?}", instance.status),
            reason: reason.map(str::to_string),
        };
        Self::new(event_type, serde_json::to_value(payload).unwrap_or_default())
            .with_session(&instance.owner_id)
            .with_actor("supervisor")
    }

    /// `security_accepted` / `security_rejected`.
    pub fn security_decision(
        session_id: Option<&str>,
        command: &str,
        rejection: Option<(ErrorKind, &str)>,
    ) -> Self {
        let (event_type, severity, payload) = match rejection {
            None => (
                EventType::SecurityAccepted,
                EventSeverity::Debug,
                SecurityDecisionPayload {
                    command: command.to_string(),
                    decision: "accept".to_string(),
                    reason: None,
                    error_kind: None,
                },
            ),
            Some((kind, reason)) => (
                EventType::SecurityRejected,
                EventSeverity::Warning,
                SecurityDecisionPayload {
                    command: command.to_string(),
                    decision: "reject".to_string(),
                    reason: Some(reason.to_string()),
                    error_kind: Some(kind),
                },
            ),
        };
        let mut event = Self::new(event_type, serde_json::to_value(payload).unwrap_or_default())
            .with_actor("security-gate")
            .with_severity(severity);
        if let Some(id) = session_id {
            event = event.with_session(id);
        }
        event
    }

    /// `execution_completed`.
    pub fn execution_completed(owner_id: &str, result: &ExecutionResult) -> Self {
        let payload = ExecutionPayload {
            tool_used: result.tool_used.clone(),
            success: result.success,
            duration_ms: result.duration_ms,
            error_kind: result.error_kind,
        };
        let severity = if result.success {
            EventSeverity::Info
        } else {
            EventSeverity::Warning
        };
        Self::new(
            EventType::ExecutionCompleted,
            serde_json::to_value(payload).unwrap_or_default(),
        )
        .with_session(owner_id)
        .with_actor("orchestrator")
        .with_severity(severity)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Sandbox passed its first health probe
    SandboxCreated,
    /// Sandbox torn down and its port released
    SandboxStopped,
    /// Consecutive probe failures crossed the threshold
    SandboxDegraded,
    /// Orphaned sandbox found and reclaimed
    SandboxReclaimed,
    SecurityAccepted,
    SecurityRejected,
    ExecutionCompleted,
    SessionCreated,
    SessionRevoked,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SandboxCreated => "sandbox_created",
            Self::SandboxStopped => "sandbox_stopped",
            Self::SandboxDegraded => "sandbox_degraded",
            Self::SandboxReclaimed => "sandbox_reclaimed",
            Self::SecurityAccepted => "security_accepted",
            Self::SecurityRejected => "security_rejected",
            Self::ExecutionCompleted => "execution_completed",
            Self::SessionCreated => "session_created",
            Self::SessionRevoked => "session_revoked",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// Helper structs for common payloads

#[derive(Serialize, Deserialize)]
pub struct SandboxEventPayload {
    pub sandbox_id: String,
    pub tool: String,
    pub port: u16,
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct SecurityDecisionPayload {
    pub command: String,
    pub decision: String,
    pub reason: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

#[derive(Serialize, Deserialize)]
pub struct ExecutionPayload {
    pub tool_used: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error_kind: Option<ErrorKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&EventType::SandboxCreated).unwrap();
        assert_eq!(json, "\"sandbox_created\"");
        assert_eq!(EventType::SecurityRejected.as_str(), "security_rejected");
    }

    #[test]
    fn test_security_rejection_event() {
        let event = EventEnvelope::security_decision(
            Some("sess-1"),
            "execute",
            Some((ErrorKind::RateLimited, "rate_limited")),
        );
        assert_eq!(event.event_type, EventType::SecurityRejected);
        assert_eq!(event.severity, EventSeverity::Warning);
        assert_eq!(event.session_id.as_deref(), Some("sess-1"));
        assert_eq!(event.payload["reason"], "rate_limited");
        assert_eq!(event.payload["error_kind"], "RateLimited");
    }
}
