use async_trait::async_trait;

use crate::types::{ExecutionRequest, ExecutionResult};

/// Runs an authorized execution request to completion.
///
/// Never returns an error: every failure is reported as an
/// `ExecutionResult` with `success = false` and an `error_kind`.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Execute `request` on behalf of `owner_id` (the session id).
    async fn execute(&self, owner_id: &str, request: ExecutionRequest) -> ExecutionResult;
}
