//! The adapter contract shared by every tool backend.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use neural_bridge_core::{
    Error, ErrorKind, ExecutionRequest, ExecutionResult, Result, SandboxInstance, SandboxStatus,
    ToolKind,
};
use neural_bridge_sandbox::{ExecResult, Invocation, SandboxEngine};

/// Translates generic execution requests into one backend's invocation.
///
/// `execute` never returns an error. A tool that ran and failed reports
/// `ToolExecutionFailed`; a tool that could not run reports
/// `ProcessSpawnFailed`; a tool that overran reports `Timeout`.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Engine used to run invocations inside the sandbox.
    fn engine(&self) -> &Arc<dyn SandboxEngine>;

    fn exec_timeout(&self) -> Duration;

    /// Native command line for `request` against `sandbox`.
    fn build_invocation(&self, request: &ExecutionRequest, sandbox: &SandboxInstance)
        -> Result<Invocation>;

    /// Output text for a successful run.
    fn normalize_output(&self, exec: &ExecResult) -> String {
        exec.combined_output()
    }

    async fn execute(&self, request: &ExecutionRequest, sandbox: &SandboxInstance) -> ExecutionResult {
        let started = Instant::now();
        let tool = self.kind();
        let elapsed = || started.elapsed().as_millis() as u64;

        if sandbox.tool_kind != tool {
            return ExecutionResult::failure(
                tool.as_str(),
                ErrorKind::InvalidPayload,
                format!(
                    "sandbox {} was provisioned for {}, not {}",
                    sandbox.id, sandbox.tool_kind, tool
                ),
                elapsed(),
            );
        }
        if !matches!(sandbox.status, SandboxStatus::Healthy | SandboxStatus::Degraded) {
            return ExecutionResult::failure(
                tool.as_str(),
                ErrorKind::HealthCheckFailed,
                format!("sandbox {} is {:?}", sandbox.id, sandbox.status),
                elapsed(),
            );
        }

        let invocation = match self.build_invocation(request, sandbox) {
            Ok(invocation) => invocation,
            Err(e) => return ExecutionResult::from_error(tool.as_str(), &e, elapsed()),
        };

        tracing::info!(
            tool = %tool,
            sandbox_id = %sandbox.id,
            program = %invocation.program,
            task_len = request.task_description.len(),
            "Dispatching task to tool"
        );

        let timeout = self.exec_timeout();
        let result = match self.engine().exec(&sandbox.handle, &invocation, timeout).await {
            Err(e) => {
                tracing::warn!(tool = %tool, sandbox_id = %sandbox.id, error = %e, "Tool could not be run");
                ExecutionResult::from_error(tool.as_str(), &e, elapsed())
            }
            Ok(exec) if exec.timed_out => ExecutionResult::failure(
                tool.as_str(),
                ErrorKind::Timeout,
                format!(
                    "{} timed out after {:?}\n{}",
                    tool,
                    timeout,
                    exec.combined_output()
                ),
                elapsed(),
            ),
            Ok(exec) if !exec.success() => ExecutionResult::failure(
                tool.as_str(),
                ErrorKind::ToolExecutionFailed,
                format!(
                    "{} exited with code {}\n{}",
                    tool,
                    exec.exit_code,
                    exec.combined_output()
                ),
                elapsed(),
            ),
            Ok(exec) => ExecutionResult::success(tool.as_str(), self.normalize_output(&exec), elapsed()),
        };

        tracing::info!(
            tool = %tool,
            sandbox_id = %sandbox.id,
            success = result.success,
            error_kind = ?result.error_kind,
            duration_ms = result.duration_ms,
            "Tool finished"
        );
        result
    }
}

/// Non-empty, trimmed task text.
pub(crate) fn task_text(request: &ExecutionRequest) -> Result<&str> {
    let task = request.task_description.trim();
    if task.is_empty() {
        return Err(Error::invalid_payload("task_description is empty"));
    }
    Ok(task)
}
