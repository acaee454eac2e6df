//! Sandbox engine capability.
//!
//! The supervisor drives every container or process through this trait, so the
//! backing primitive (Docker, native processes, an in-memory mock) can be
//! swapped without touching lifecycle logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use neural_bridge_core::config::{ProbeKind, ToolProfile};
use neural_bridge_core::{Result, SandboxId, ToolKind};

/// Label/tag value that marks units created by this engine.
pub const MANAGED_BY: &str = "neural-bridge";

// =============================================================================
// Engine Types
// =============================================================================

/// Everything an engine needs to launch one sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub sandbox_id: SandboxId,
    pub tool_kind: ToolKind,
    pub port: u16,
    pub profile: ToolProfile,
}

impl LaunchSpec {
    /// Profile command with `{port}` substituted.
    pub fn command(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.profile
            .command
            .iter()
            .map(|part| part.replace("{port}", &port))
            .collect()
    }

    /// Environment passed to the unit: profile env plus the port contract.
    pub fn env(&self) -> HashMap<String, String> {
        let mut env = self.profile.env.clone();
        env.insert("SANDBOX_PORT".into(), self.port.to_string());
        env.insert("SANDBOX_ID".into(), self.sandbox_id.to_string());
        env
    }
}

/// A single command run against a live sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Value of an environment variable, if set.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Result of executing a command in the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Exit code of the command.
    pub exit_code: i64,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Whether the command timed out.
    pub timed_out: bool,
}

impl ExecResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    /// Whether the execution was successful (exit code 0, no timeout).
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout followed by stderr, separated when both are present.
    pub fn combined_output(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n--- stderr ---\n{}", stdout, stderr),
        }
    }
}

/// A unit carrying the managed label, as reported by the engine.
#[derive(Debug, Clone)]
pub struct ManagedUnit {
    pub handle: String,
    pub sandbox_id: Option<SandboxId>,
    pub port: Option<u16>,
    pub running: bool,
}

// =============================================================================
// Sandbox Engine Trait
// =============================================================================

/// Primitive operations over containers or processes.
///
/// Engines hold no lifecycle policy; timeouts, retries and state transitions
/// belong to the supervisor.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Check if the backend is usable (e.g., Docker daemon reachable).
    async fn is_available(&self) -> bool;

    /// Launch a unit bound to `spec.port`. Returns the engine handle.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String>;

    /// Single health probe.
    async fn probe(&self, handle: &str, port: u16, kind: ProbeKind, timeout: Duration)
        -> Result<()>;

    /// Run a command against the unit.
    async fn exec(&self, handle: &str, invocation: &Invocation, timeout: Duration)
        -> Result<ExecResult>;

    /// Ask the unit to shut down gracefully.
    async fn signal_stop(&self, handle: &str) -> Result<()>;

    /// Force the unit down.
    async fn kill(&self, handle: &str) -> Result<()>;

    /// Whether the unit still exists and runs.
    async fn is_running(&self, handle: &str) -> Result<bool>;

    /// Release whatever the engine still tracks for a dead unit.
    async fn reap(&self, handle: &str) -> Result<()>;

    /// Every unit carrying the managed label, ours or from a previous run.
    async fn list_managed(&self) -> Result<Vec<ManagedUnit>>;
}

/// TCP connect probe against the loopback port.
pub(crate) async fn probe_tcp(port: u16, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(("127.0.0.1", port))).await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(neural_bridge_core::Error::HealthCheckFailed(format!(
            "port {} refused connection: {}",
            port, e
        ))),
        Err(_) => Err(neural_bridge_core::Error::HealthCheckFailed(format!(
            "port {} probe timed out after {:?}",
            port, timeout
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &[&str]) -> LaunchSpec {
        LaunchSpec {
            sandbox_id: SandboxId::from("nb-test"),
            tool_kind: ToolKind::MultiAgentFlow,
            port: 50007,
            profile: ToolProfile {
                image: String::new(),
                command: command.iter().map(|s| s.to_string()).collect(),
                env: HashMap::from([("NODE_ENV".to_string(), "production".to_string())]),
                probe: ProbeKind::Tcp,
                workdir: None,
            },
        }
    }

    #[test]
    fn test_launch_spec_substitutes_port() {
        let spec = spec(&["npx", "claude-flow@alpha", "start", "--port", "{port}"]);
        assert_eq!(spec.command()[4], "50007");
        let env = spec.env();
        assert_eq!(env["SANDBOX_PORT"], "50007");
        assert_eq!(env["SANDBOX_ID"], "nb-test");
        assert_eq!(env["NODE_ENV"], "production");
    }

    #[test]
    fn test_exec_result_success() {
        assert!(ExecResult::ok("hello").success());

        let timeout_result = ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        };
        assert!(!timeout_result.success());
    }

    #[test]
    fn test_combined_output() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "built\n".into(),
            stderr: "warning: unused\n".into(),
            timed_out: false,
        };
        assert_eq!(
            result.combined_output(),
            "built\n--- stderr ---\nwarning: unused"
        );
        assert_eq!(ExecResult::ok("only out\n").combined_output(), "only out");
    }

    #[tokio::test]
    async fn test_probe_tcp_refused_on_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_tcp(port, Duration::from_secs(1)).await.is_ok());
        drop(listener);
        assert!(probe_tcp(port, Duration::from_secs(1)).await.is_err());
    }
}
