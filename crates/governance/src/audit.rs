//! Audit trail of security gate decisions.
//!
//! Entries carry metadata only: session, command, decision and reason.
//! Payload content is never recorded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use neural_bridge_core::{ErrorKind, Result};

/// Outcome of an audited decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Accepted,
    Rejected,
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Unknown when the token did not resolve to a session.
    pub session_id: Option<String>,
    pub command: String,
    pub outcome: AuditOutcome,
    /// Reason code for rejections (e.g. `rate_limited`).
    pub reason: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl AuditEntry {
    pub fn accepted(session_id: &str, command: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            session_id: Some(session_id.to_string()),
            command: command.to_string(),
            outcome: AuditOutcome::Accepted,
            reason: None,
            error_kind: None,
        }
    }

    pub fn rejected(session_id: Option<String>, command: &str, kind: ErrorKind, reason: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            session_id,
            command: command.to_string(),
            outcome: AuditOutcome::Rejected,
            reason: Some(reason.to_string()),
            error_kind: Some(kind),
        }
    }
}

/// Filter for querying audit logs.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub session_id: Option<String>,
    pub command: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        self.session_id
            .as_ref()
            .map_or(true, |s| entry.session_id.as_ref() == Some(s))
            && self.command.as_ref().map_or(true, |c| &entry.command == c)
            && self.outcome.map_or(true, |o| entry.outcome == o)
            && self.since.map_or(true, |t| entry.timestamp >= t)
    }
}

/// Trait for audit log persistence.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn log(&self, entry: AuditEntry) -> Result<()>;

    /// Matching entries, oldest first.
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>>;
}

const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Bounded in-memory audit store. The oldest entries are dropped first.
pub struct InMemoryAuditStore {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn log(&self, entry: AuditEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_filters() {
        let store = InMemoryAuditStore::new();
        store.log(AuditEntry::accepted("s1", "execute")).await.unwrap();
        store
            .log(AuditEntry::rejected(
                Some("s1".into()),
                "execute",
                ErrorKind::RateLimited,
                "rate_limited",
            ))
            .await
            .unwrap();
        store
            .log(AuditEntry::rejected(None, "stop_sandbox", ErrorKind::SecurityRejected, "unknown_session"))
            .await
            .unwrap();

        let rejected = store
            .query(AuditFilter {
                outcome: Some(AuditOutcome::Rejected),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rejected.len(), 2);

        let s1 = store
            .query(AuditFilter {
                session_id: Some("s1".into()),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].outcome, AuditOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let store = InMemoryAuditStore::with_capacity(2);
        for command in ["a", "b", "c"] {
            store.log(AuditEntry::accepted("s", command)).await.unwrap();
        }
        let all = store.query(AuditFilter::default()).await.unwrap();
        let commands: Vec<_> = all.iter().map(|e| e.command.as_str()).collect();
        assert_eq!(commands, vec!["b", "c"]);
    }
}
