//! Code generation backend (`codex` CLI).

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use std::sync::Arc;
use std::time::Duration;

use neural_bridge_core::config::AdapterConfig;
use neural_bridge_core::{
    CodeGenMode, Error, ExecutionRequest, Result, SandboxInstance, ToolKind,
};
use neural_bridge_sandbox::{ExecResult, Invocation, SandboxEngine};

use crate::adapter::{task_text, ToolAdapter};

/// Flags that would override the approval mode chosen by the request.
const APPROVAL_OVERRIDES: &[&str] = &["--approval-mode", "-a", "--full-auto", "--auto-edit"];

/// Runs `codex --approval-mode <mode> --quiet [extra args] -- <task>` in the sandbox.
///
/// The task always follows `--`, so text such as `--full-auto` stays a
/// prompt and never becomes a flag.
///
/// The sub-mode must be set explicitly on every request; there is no
/// implicit default at this layer.
pub struct CodeGenAdapter {
    engine: Arc<dyn SandboxEngine>,
    api_key: Option<Secret<String>>,
    exec_timeout: Duration,
}

impl CodeGenAdapter {
    pub fn new(engine: Arc<dyn SandboxEngine>, config: &AdapterConfig) -> Self {
        Self {
            engine,
            api_key: config.openai_api_key.clone(),
            exec_timeout: Duration::from_secs(config.exec_timeout_secs),
        }
    }
}

fn check_extra_args(args: &[String]) -> Result<()> {
    for arg in args {
        let flag = arg.split('=').next().unwrap_or(arg);
        if APPROVAL_OVERRIDES.contains(&flag) || flag.starts_with("--dangerously") {
            return Err(Error::invalid_payload(format!(
                "argument '{}' conflicts with the requested sub-mode",
                flag
            )));
        }
    }
    Ok(())
}

/// `{"result": "..."}` on stdout, when the CLI printed one.
fn json_result(stdout: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    match value.get("result")? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl ToolAdapter for CodeGenAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::CodeGen
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
        let mode = request.codegen_mode.ok_or_else(|| {
            Error::invalid_payload("code generation requires a sub-mode (suggest, auto-edit, full-auto)")
        })?;
        let task = task_text(request)?;
        check_extra_args(&request.extra_args)?;

        if mode == CodeGenMode::FullAuto {
            tracing::warn!(sandbox_id = %sandbox.id, "Running code generation in full-auto mode");
        }

        let mut invocation = Invocation::new("codex")
            .args(["--approval-mode", mode.as_str(), "--quiet"])
            .args(request.extra_args.iter().cloned())
            .args(["--", task])
            .env("SANDBOX_PORT", sandbox.assigned_port.to_string())
            .env("CODEX_HEADLESS", "1")
            .env("NO_COLOR", "1");
        match &self.api_key {
            Some(key) => invocation = invocation.env("OPENAI_API_KEY", key.expose_secret().clone()),
            None => tracing::debug!("No OpenAI key configured; relying on sandbox environment"),
        }
        Ok(invocation)
    }

    fn normalize_output(&self, exec: &ExecResult) -> String {
        json_result(&exec.stdout).unwrap_or_else(|| exec.combined_output())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fixtures;
    use neural_bridge_core::{ErrorKind, SandboxId};
    use neural_bridge_sandbox::MockEngine;

    fn adapter(engine: Arc<MockEngine>) -> CodeGenAdapter {
        let config = AdapterConfig {
            openai_api_key: Some(Secret::new("sk-test".into())),
            ..AdapterConfig::default()
        };
        CodeGenAdapter::new(engine, &config)
    }

    #[test]
    fn test_invocation_carries_explicit_mode() {
        let adapter = adapter(Arc::new(MockEngine::new()));
        let request = ExecutionRequest::single("add unit tests", ToolKind::CodeGen)
            .with_codegen_mode(CodeGenMode::AutoEdit);

        let invocation = adapter
            .build_invocation(&request, &fixtures::sandbox(ToolKind::CodeGen, "h"))
            .unwrap();
        assert_eq!(invocation.program, "codex");
        assert_eq!(
            invocation.args,
            vec!["--approval-mode", "auto-edit", "--quiet", "--", "add unit tests"]
        );
        assert_eq!(invocation.env_value("OPENAI_API_KEY"), Some("sk-test"));
        assert_eq!(invocation.env_value("CODEX_HEADLESS"), Some("1"));
    }

    #[test]
    fn test_missing_mode_rejected() {
        let adapter = adapter(Arc::new(MockEngine::new()));
        let request = ExecutionRequest::single("add unit tests", ToolKind::CodeGen);
        let err = adapter
            .build_invocation(&request, &fixtures::sandbox(ToolKind::CodeGen, "h"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPayload);
    }

    #[test]
    fn test_approval_override_flags_rejected() {
        let adapter = adapter(Arc::new(MockEngine::new()));
        for flag in ["--full-auto", "--approval-mode=full-auto", "-a", "--dangerously-auto-approve-everything"] {
            let request = ExecutionRequest::single("task", ToolKind::CodeGen)
                .with_codegen_mode(CodeGenMode::Suggest)
                .with_extra_args(vec![flag.to_string()]);
            assert!(
                adapter
                    .build_invocation(&request, &fixtures::sandbox(ToolKind::CodeGen, "h"))
                    .is_err(),
                "{} should be rejected",
                flag
            );
        }
    }

    #[test]
    fn test_flag_like_task_stays_positional() {
        let adapter = adapter(Arc::new(MockEngine::new()));
        let request = ExecutionRequest::single("--full-auto", ToolKind::CodeGen)
            .with_codegen_mode(CodeGenMode::Suggest)
            .with_extra_args(vec!["--model=o4-mini".into()]);

        let invocation = adapter
            .build_invocation(&request, &fixtures::sandbox(ToolKind::CodeGen, "h"))
            .unwrap();
        assert_eq!(
            invocation.args,
            vec!["--approval-mode", "suggest", "--quiet", "--model=o4-mini", "--", "--full-auto"]
        );
    }

    #[test]
    fn test_json_result_extracted() {
        assert_eq!(json_result(r#"{"result": "patched 3 files"}"#).as_deref(), Some("patched 3 files"));
        assert_eq!(json_result("plain text output"), None);
        assert_eq!(json_result(r#"{"status": "ok"}"#), None);
    }

    #[tokio::test]
    async fn test_execute_returns_parsed_result() {
        let engine = Arc::new(MockEngine::with_exec_responses(vec![ExecResult::ok(
            r#"{"result": "fn add(a: i32, b: i32) -> i32 { a + b }"}"#,
        )]));
        let handle = engine.inject_foreign_unit(SandboxId::from("nb-test"), 50003);
        let adapter = adapter(engine.clone());

        let request = ExecutionRequest::single("write add", ToolKind::CodeGen)
            .with_codegen_mode(CodeGenMode::Suggest);
        let result = adapter
            .execute(&request, &fixtures::sandbox(ToolKind::CodeGen, &handle))
            .await;
        assert!(result.success);
        assert_eq!(result.output, "fn add(a: i32, b: i32) -> i32 { a + b }");
    }
}
