//! Sandbox instance model and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tool::ToolKind;

/// Unique identifier for a sandbox instance. Never reused.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(pub String);

impl SandboxId {
    pub fn new() -> Self {
        Self(format!("nb-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a sandbox.
///
/// ```text
/// Starting ──► Healthy ◄──► Degraded
///    │            │            │
///    └────────────┴─► Stopping ┴─► Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxStatus {
    Starting,
    Healthy,
    Degraded,
    Stopping,
    Stopped,
}

impl SandboxStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        matches!(
            (self, next),
            (Starting, Healthy)
                | (Starting, Stopping)
                | (Healthy, Degraded)
                | (Degraded, Healthy)
                | (Healthy, Stopping)
                | (Degraded, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

/// One port-bound running copy of a tool backend.
///
/// Owned by the supervisor. Everything outside it works on snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInstance {
    pub id: SandboxId,
    pub tool_kind: ToolKind,
    /// Session that requested the sandbox.
    pub owner_id: String,
    pub assigned_port: u16,
    pub status: SandboxStatus,
    /// Engine-specific reference (container id, pid).
    pub handle: String,
    pub created_at: DateTime<Utc>,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

/// Result of a single health probe round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub id: SandboxId,
    pub status: SandboxStatus,
    /// Outcome of this probe.
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use SandboxStatus::*;
        assert!(Starting.can_transition_to(Healthy));
        assert!(Healthy.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Healthy));
        assert!(Degraded.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Healthy));
        assert!(!Starting.can_transition_to(Degraded));
        assert!(!Healthy.can_transition_to(Stopped));
        assert!(!Stopping.can_transition_to(Healthy));
    }

    #[test]
    fn test_sandbox_ids_are_unique() {
        let a = SandboxId::new();
        let b = SandboxId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("nb-"));
    }
}
