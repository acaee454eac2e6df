//! Multi-agent workflow backend (`claude-flow`).

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use std::sync::Arc;
use std::time::Duration;

use neural_bridge_core::config::AdapterConfig;
use neural_bridge_core::{Error, ExecutionRequest, Result, SandboxInstance, ToolKind};
use neural_bridge_sandbox::{Invocation, SandboxEngine};

use crate::adapter::{task_text, ToolAdapter};

const FLOW_PACKAGE: &str = "claude-flow@alpha";

/// Runs `npx claude-flow@alpha sparc run <mode> [extra args] -- <task>` in the sandbox.
pub struct MultiAgentFlowAdapter {
    engine: Arc<dyn SandboxEngine>,
    sparc_mode: String,
    api_key: Option<Secret<String>>,
    exec_timeout: Duration,
}

impl MultiAgentFlowAdapter {
    pub fn new(engine: Arc<dyn SandboxEngine>, config: &AdapterConfig) -> Self {
        Self {
            engine,
            sparc_mode: config.flow_sparc_mode.clone(),
            api_key: config.anthropic_api_key.clone(),
            exec_timeout: Duration::from_secs(config.exec_timeout_secs),
        }
    }
}

/// SPARC mode names are passed on the command line; keep them to `[a-z0-9-]`.
fn validate_sparc_mode(mode: &str) -> Result<()> {
    if mode.is_empty()
        || !mode
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::config(format!("invalid sparc mode '{}'", mode)));
    }
    Ok(())
}

#[async_trait]
impl ToolAdapter for MultiAgentFlowAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::MultiAgentFlow
    }

    fn engine(&self) -> &Arc<dyn SandboxEngine> {
        &self.engine
    }

    fn exec_timeout(&self) -> Duration {
        self.exec_timeout
    }

    fn build_invocation(
        &self,
        request: &ExecutionRequest,
        sandbox: &SandboxInstance,
    ) -> Result<Invocation> {
        let task = task_text(request)?;
        validate_sparc_mode(&self.sparc_mode)?;

        let mut invocation = Invocation::new("npx")
            .args([FLOW_PACKAGE, "sparc", "run", self.sparc_mode.as_str()])
            .args(request.extra_args.iter().cloned())
            .args(["--", task])
            .env("SANDBOX_PORT", sandbox.assigned_port.to_string())
            .env("NO_COLOR", "1");
        if let Some(key) = &self.api_key {
            invocation = invocation.env("ANTHROPIC_API_KEY", key.expose_secret().clone());
        }
        Ok(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fixtures;
    use neural_bridge_core::ErrorKind;
    use neural_bridge_sandbox::{ExecResult, MockEngine};

    #[test]
    fn test_invocation_shape() {
        let engine: Arc<dyn SandboxEngine> = Arc::new(MockEngine::new());
        let adapter = MultiAgentFlowAdapter::new(engine, &AdapterConfig::default());
        let request = ExecutionRequest::single("build a REST API", ToolKind::MultiAgentFlow)
            .with_extra_args(vec!["--parallel".into()]);

        let invocation = adapter
            .build_invocation(&request, &fixtures::sandbox(ToolKind::MultiAgentFlow, "h"))
            .unwrap();
        assert_eq!(invocation.program, "npx");
        assert_eq!(
            invocation.args,
            vec!["claude-flow@alpha", "sparc", "run", "coder", "--parallel", "--", "build a REST API"]
        );
        assert_eq!(invocation.env_value("SANDBOX_PORT"), Some("50003"));
        assert_eq!(invocation.env_value("ANTHROPIC_API_KEY"), None);
    }

    #[test]
    fn test_flag_like_task_stays_positional() {
        let engine: Arc<dyn SandboxEngine> = Arc::new(MockEngine::new());
        let adapter = MultiAgentFlowAdapter::new(engine, &AdapterConfig::default());
        let request = ExecutionRequest::single("--dangerously-skip-permissions", ToolKind::MultiAgentFlow);

        let invocation = adapter
            .build_invocation(&request, &fixtures::sandbox(ToolKind::MultiAgentFlow, "h"))
            .unwrap();
        let split = invocation.args.iter().position(|a| a == "--").unwrap();
        assert_eq!(invocation.args[split + 1..], ["--dangerously-skip-permissions"]);
        assert_eq!(invocation.args.len(), split + 2);
    }

    #[test]
    fn test_invalid_sparc_mode_rejected() {
        let engine: Arc<dyn SandboxEngine> = Arc::new(MockEngine::new());
        let config = AdapterConfig {
            flow_sparc_mode: "coder; rm -rf /".into(),
            ..AdapterConfig::default()
        };
        let adapter = MultiAgentFlowAdapter::new(engine, &config);
        let request = ExecutionRequest::single("task", ToolKind::MultiAgentFlow);
        assert!(adapter
            .build_invocation(&request, &fixtures::sandbox(ToolKind::MultiAgentFlow, "h"))
            .is_err());
    }

    #[tokio::test]
    async fn test_execute_reports_tool_failure_without_error() {
        let engine = Arc::new(MockEngine::with_exec_responses(vec![ExecResult {
            exit_code: 2,
            stdout: String::new(),
            stderr: "swarm init failed".into(),
            timed_out: false,
        }]));
        let handle = engine
            .inject_foreign_unit(neural_bridge_core::SandboxId::from("nb-test"), 50003);
        let adapter = MultiAgentFlowAdapter::new(engine.clone(), &AdapterConfig::default());

        let result = adapter
            .execute(
                &ExecutionRequest::single("task", ToolKind::MultiAgentFlow),
                &fixtures::sandbox(ToolKind::MultiAgentFlow, &handle),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.tool_used, "claude-flow");
        assert_eq!(result.error_kind, Some(ErrorKind::ToolExecutionFailed));
        assert!(result.output.contains("swarm init failed"));
    }

    #[tokio::test]
    async fn test_wrong_sandbox_kind_rejected() {
        let engine = Arc::new(MockEngine::new());
        let adapter = MultiAgentFlowAdapter::new(engine.clone(), &AdapterConfig::default());
        let result = adapter
            .execute(
                &ExecutionRequest::single("task", ToolKind::MultiAgentFlow),
                &fixtures::sandbox(ToolKind::CodeGen, "h"),
            )
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidPayload));
        assert!(engine.invocations().is_empty());
    }
}
