//! Command dispatch behind the security gate.
//!
//! Every envelope is authorized first; nothing below the gate runs for a
//! rejected command. The session id becomes the owner of any sandbox the
//! command creates, and sandbox commands only see the caller's own sandboxes.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use neural_bridge_core::{
    CommandEnvelope, Error, ErrorKind, ExecutionRequest, Orchestrator, ResponseEnvelope,
    SandboxId, SandboxInstance,
};
use neural_bridge_governance::{track_command, SecurityGate, Session};
use neural_bridge_sandbox::Supervisor;

/// Commands accepted on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Execute,
    ListSandboxes,
    StopSandbox,
    HealthCheck,
    CleanupOrphans,
    Logout,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::Execute,
        Command::ListSandboxes,
        Command::StopSandbox,
        Command::HealthCheck,
        Command::CleanupOrphans,
        Command::Logout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::ListSandboxes => "list_sandboxes",
            Self::StopSandbox => "stop_sandbox",
            Self::HealthCheck => "health_check",
            Self::CleanupOrphans => "cleanup_orphans",
            Self::Logout => "logout",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

#[derive(Debug, Deserialize)]
struct SandboxRef {
    sandbox_id: String,
}

pub struct CommandDispatcher {
    gate: Arc<SecurityGate>,
    orchestrator: Arc<dyn Orchestrator>,
    supervisor: Arc<Supervisor>,
}

impl CommandDispatcher {
    pub fn new(
        gate: Arc<SecurityGate>,
        orchestrator: Arc<dyn Orchestrator>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            gate,
            orchestrator,
            supervisor,
        }
    }

    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub async fn dispatch(&self, envelope: CommandEnvelope) -> ResponseEnvelope {
        let command = Command::parse(&envelope.command_name);
        let label = command.map(|c| c.as_str()).unwrap_or("unknown");

        let payload_text = envelope.payload.to_string();
        let session = match self
            .gate
            .authorize(&envelope.session_token, &envelope.command_name, &payload_text)
            .await
        {
            Ok(session) => session,
            Err(rejection) => {
                track_command(label, rejection.kind().as_str());
                return ResponseEnvelope::error(rejection.kind(), rejection.to_string());
            }
        };

        let response = match command {
            Some(command) => match self.run(command, &session, &envelope).await {
                Ok(response) => response,
                Err(e) => ResponseEnvelope::from(&e),
            },
            None => ResponseEnvelope::from(&Error::UnknownCommand(envelope.command_name.clone())),
        };

        let outcome = response.error_kind().map(|k| k.as_str()).unwrap_or("ok");
        track_command(label, outcome);
        tracing::debug!(command = label, session_id = %session.id, outcome = outcome, "Command handled");
        response
    }

    async fn run(
        &self,
        command: Command,
        session: &Session,
        envelope: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, Error> {
        match command {
            Command::Execute => {
                let request: ExecutionRequest = serde_json::from_value(envelope.payload.clone())
                    .map_err(|e| Error::invalid_payload(format!("execute payload: {}", e)))?;
                let result = self.orchestrator.execute(&session.id, request).await;
                let error = result.error_kind.map(|kind| (kind, result.output.clone()));
                let data = serde_json::to_value(&result)?;
                Ok(match error {
                    None if result.success => ResponseEnvelope::ok(data),
                    None => ResponseEnvelope {
                        data,
                        ..ResponseEnvelope::error(ErrorKind::ToolExecutionFailed, "execution failed")
                    },
                    Some((kind, message)) => ResponseEnvelope {
                        data,
                        ..ResponseEnvelope::error(kind, message)
                    },
                })
            }
            Command::ListSandboxes => {
                let sandboxes: Vec<SandboxInstance> = self
                    .supervisor
                    .list()
                    .await
                    .into_iter()
                    .filter(|s| s.owner_id == session.id)
                    .collect();
                Ok(ResponseEnvelope::ok(json!({ "sandboxes": sandboxes })))
            }
            Command::StopSandbox => {
                let id = self.owned_sandbox(session, &envelope.payload).await?;
                self.supervisor.stop_sandbox(&id).await?;
                Ok(ResponseEnvelope::ok(json!({ "stopped": id })))
            }
            Command::HealthCheck => {
                let id = self.owned_sandbox(session, &envelope.payload).await?;
                let health = self.supervisor.health_check(&id).await?;
                Ok(ResponseEnvelope::ok(serde_json::to_value(health)?))
            }
            Command::CleanupOrphans => {
                let reclaimed = self.supervisor.cleanup_orphaned().await;
                Ok(ResponseEnvelope::ok(json!({ "reclaimed": reclaimed })))
            }
            Command::Logout => {
                let stopped = self.supervisor.stop_owned_by(&session.id).await;
                self.gate
                    .sessions()
                    .revoke_session(&envelope.session_token)
                    .await;
                Ok(ResponseEnvelope::ok(json!({ "stopped": stopped })))
            }
        }
    }

    /// Resolve `{"sandbox_id": ...}` to a sandbox owned by `session`.
    /// Sandboxes of other sessions are reported as not found.
    async fn owned_sandbox(&self, session: &Session, payload: &Value) -> Result<SandboxId, Error> {
        let SandboxRef { sandbox_id } = serde_json::from_value(payload.clone())
            .map_err(|e| Error::invalid_payload(format!("expected {{\"sandbox_id\": ...}}: {}", e)))?;
        let id = SandboxId::from(sandbox_id.as_str());
        match self.supervisor.get(&id).await {
            Some(instance) if instance.owner_id == session.id => Ok(id),
            _ => Err(Error::SandboxNotFound(sandbox_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names_round_trip() {
        for command in Command::ALL {
            assert_eq!(Command::parse(command.as_str()), Some(command));
        }
        assert_eq!(Command::parse("rm_rf"), None);
        assert_eq!(Command::parse("Execute"), None);
    }
}
