//! Mock implementations of core traits for testing.
//!
//! Shared across crates so integration tests can observe events and
//! orchestrator calls without real sandboxes.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::{
    events::{EventEnvelope, EventType},
    traits::{EventEmitter, Orchestrator},
    types::{ExecutionRequest, ExecutionResult},
};

// =============================================================================
// Recording Event Emitter
// =============================================================================

/// Captures every emitted event in memory.
#[derive(Default)]
pub struct RecordingEventEmitter {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingEventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of recorded events of the given type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventEmitter for RecordingEventEmitter {
    async fn emit(&self, event: EventEnvelope) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

// =============================================================================
// Spy Orchestrator
// =============================================================================

/// Orchestrator that records calls and returns a canned success.
pub struct SpyOrchestrator {
    calls: AtomicUsize,
    requests: Mutex<Vec<(String, ExecutionRequest)>>,
}

impl SpyOrchestrator {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of times `execute` was invoked.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Owner ids and requests seen so far.
    pub fn requests(&self) -> Vec<(String, ExecutionRequest)> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for SpyOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for SpyOrchestrator {
    async fn execute(&self, owner_id: &str, request: ExecutionRequest) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tool = request
            .tool_hint
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|| "spy".to_string());
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((owner_id.to_string(), request));
        ExecutionResult::success(tool, "[spy] executed", 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolKind;

    #[tokio::test]
    async fn test_spy_orchestrator_records_calls() {
        let spy = SpyOrchestrator::new();
        let result = spy
            .execute("sess-1", ExecutionRequest::single("task", ToolKind::CodeGen))
            .await;
        assert!(result.success);
        assert_eq!(result.tool_used, "openai-codex");
        assert_eq!(spy.call_count(), 1);
        assert_eq!(spy.requests()[0].0, "sess-1");
    }

    #[tokio::test]
    async fn test_recording_emitter_counts() {
        let emitter = RecordingEventEmitter::new();
        emitter
            .emit(EventEnvelope::new(
                EventType::SessionCreated,
                serde_json::json!({}),
            ))
            .await;
        assert_eq!(emitter.count(EventType::SessionCreated), 1);
        assert_eq!(emitter.count(EventType::SessionRevoked), 0);
    }
}
