//! Session expiry releases the sandboxes the session owned, the same way
//! `logout` does.

use async_trait::async_trait;
use std::sync::Arc;

use neural_bridge_governance::{Session, SessionExpiryHook};
use neural_bridge_sandbox::Supervisor;

pub struct StopSandboxesOnExpiry {
    supervisor: Arc<Supervisor>,
}

impl StopSandboxesOnExpiry {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl SessionExpiryHook for StopSandboxesOnExpiry {
    async fn on_session_expired(&self, session: &Session) {
        let stopped = self.supervisor.stop_owned_by(&session.id).await;
        if !stopped.is_empty() {
            tracing::info!(session_id = %session.id, count = stopped.len(), "Stopped sandboxes of expired session");
        }
    }
}
