//! Event emitter that writes events to the tracing pipeline and counts them.

use async_trait::async_trait;

use neural_bridge_core::{EventEmitter, EventEnvelope, EventSeverity};

/// Logs each event at the level matching its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventEmitter;

#[async_trait]
impl EventEmitter for TracingEventEmitter {
    async fn emit(&self, event: EventEnvelope) {
        let session = event.session_id.as_deref().unwrap_or("-");
        let event_type = event.event_type.as_str();
        metrics::counter!("nb_events_total", "event_type" => event_type).increment(1);
        match event.severity {
            EventSeverity::Debug => tracing::debug!(
                target: "neural_bridge::events",
                event_id = %event.id,
                event_type,
                session_id = session,
                actor = %event.actor,
                payload = %event.payload,
                "Event"
            ),
            EventSeverity::Info => tracing::info!(
                target: "neural_bridge::events",
                event_id = %event.id,
                event_type,
                session_id = session,
                actor = %event.actor,
                payload = %event.payload,
                "Event"
            ),
            EventSeverity::Warning => tracing::warn!(
                target: "neural_bridge::events",
                event_id = %event.id,
                event_type,
                session_id = session,
                actor = %event.actor,
                payload = %event.payload,
                "Event"
            ),
            EventSeverity::Error => tracing::error!(
                target: "neural_bridge::events",
                event_id = %event.id,
                event_type,
                session_id = session,
                actor = %event.actor,
                payload = %event.payload,
                "Event"
            ),
        }
    }
}
