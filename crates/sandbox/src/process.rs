//! Native process sandbox engine.
//!
//! Runs each tool backend as a child process of the bridge. Isolation is
//! whatever the host provides; use the Docker engine when that matters.

use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use neural_bridge_core::config::ProbeKind;
use neural_bridge_core::{Error, Result, SandboxId};

use crate::engine::{probe_tcp, ExecResult, Invocation, LaunchSpec, ManagedUnit, SandboxEngine};

struct ProcessUnit {
    child: Child,
    sandbox_id: SandboxId,
    port: u16,
}

/// Child-process engine. Handles are the child's pid.
#[derive(Default)]
pub struct ProcessEngine {
    units: DashMap<String, Arc<Mutex<ProcessUnit>>>,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn unit(&self, handle: &str) -> Option<Arc<Mutex<ProcessUnit>>> {
        self.units.get(handle).map(|u| u.value().clone())
    }
}

#[async_trait]
impl SandboxEngine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let command = spec.command();
        let (program, args) = command.split_first().ok_or_else(|| {
            Error::config(format!("no launch command configured for {}", spec.tool_kind))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(spec.env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &spec.profile.workdir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::spawn_failed(format!("Failed to spawn '{}': {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::spawn_failed(format!("'{}' exited immediately", program)))?;
        let handle = pid.to_string();

        self.units.insert(
            handle.clone(),
            Arc::new(Mutex::new(ProcessUnit {
                child,
                sandbox_id: spec.sandbox_id.clone(),
                port: spec.port,
            })),
        );

        tracing::info!(
            sandbox_id = %spec.sandbox_id,
            pid = pid,
            port = spec.port,
            "Sandbox process started"
        );
        Ok(handle)
    }

    async fn probe(
        &self,
        handle: &str,
        port: u16,
        kind: ProbeKind,
        timeout: Duration,
    ) -> Result<()> {
        if !self.is_running(handle).await? {
            return Err(Error::HealthCheckFailed(format!(
                "process {} is not running",
                handle
            )));
        }
        match kind {
            ProbeKind::Running => Ok(()),
            ProbeKind::Tcp => probe_tcp(port, timeout).await,
        }
    }

    async fn exec(&self, handle: &str, invocation: &Invocation, timeout: Duration) -> Result<ExecResult> {
        if self.unit(handle).is_none() {
            return Err(Error::SandboxNotFound(handle.to_string()));
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.workdir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| {
            Error::spawn_failed(format!("Failed to spawn '{}': {}", invocation.program, e))
        })?;

        // Dropping the output future on timeout kills the child (kill_on_drop).
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecResult {
                exit_code: output.status.code().map(i64::from).unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(Error::spawn_failed(format!(
                "Failed to collect output of '{}': {}",
                invocation.program, e
            ))),
            Err(_) => {
                tracing::warn!(pid = %handle, program = %invocation.program, "Sandbox exec timed out");
                Ok(ExecResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("[Execution timed out after {:?}]", timeout),
                    timed_out: true,
                })
            }
        }
    }

    #[cfg(unix)]
    async fn signal_stop(&self, handle: &str) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if self.unit(handle).is_none() {
            return Ok(());
        }
        let pid: i32 = handle
            .parse()
            .map_err(|_| Error::internal(format!("invalid pid handle '{}'", handle)))?;

        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::internal(format!(
                "Failed to send SIGTERM to {}: {}",
                pid, e
            ))),
        }
    }

    #[cfg(not(unix))]
    async fn signal_stop(&self, handle: &str) -> Result<()> {
        self.kill(handle).await
    }

    async fn kill(&self, handle: &str) -> Result<()> {
        let Some(unit) = self.unit(handle) else {
            return Ok(());
        };
        let mut unit = unit.lock().await;
        if matches!(unit.child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        unit.child
            .kill()
            .await
            .map_err(|e| Error::internal(format!("Failed to kill process {}: {}", handle, e)))
    }

    async fn is_running(&self, handle: &str) -> Result<bool> {
        let Some(unit) = self.unit(handle) else {
            return Ok(false);
        };
        let mut unit = unit.lock().await;
        match unit.child.try_wait() {
            Ok(None) => Ok(true),
            Ok(Some(_)) => Ok(false),
            Err(e) => Err(Error::internal(format!(
                "Failed to poll process {}: {}",
                handle, e
            ))),
        }
    }

    async fn reap(&self, handle: &str) -> Result<()> {
        if let Some((_, unit)) = self.units.remove(handle) {
            let mut unit = unit.lock().await;
            if matches!(unit.child.try_wait(), Ok(None)) {
                let _ = unit.child.start_kill();
            }
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedUnit>> {
        let units: Vec<(String, Arc<Mutex<ProcessUnit>>)> = self
            .units
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut managed = Vec::with_capacity(units.len());
        for (handle, unit) in units {
            let mut unit = unit.lock().await;
            let running = matches!(unit.child.try_wait(), Ok(None));
            managed.push(ManagedUnit {
                handle,
                sandbox_id: Some(unit.sandbox_id.clone()),
                port: Some(unit.port),
                running,
            });
        }
        Ok(managed)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use neural_bridge_core::config::ToolProfile;
    use neural_bridge_core::ToolKind;
    use std::collections::HashMap;

    fn spec(command: &[&str]) -> LaunchSpec {
        LaunchSpec {
            sandbox_id: SandboxId::new(),
            tool_kind: ToolKind::CodeGen,
            port: 50001,
            profile: ToolProfile {
                image: String::new(),
                command: command.iter().map(|s| s.to_string()).collect(),
                env: HashMap::new(),
                probe: ProbeKind::Running,
                workdir: None,
            },
        }
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let engine = ProcessEngine::new();
        let handle = engine.launch(&spec(&["sleep", "30"])).await.unwrap();

        assert!(engine.is_running(&handle).await.unwrap());
        engine
            .probe(&handle, 50001, ProbeKind::Running, Duration::from_secs(1))
            .await
            .unwrap();

        engine.signal_stop(&handle).await.unwrap();
        for _ in 0..50 {
            if !engine.is_running(&handle).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!engine.is_running(&handle).await.unwrap());

        engine.reap(&handle).await.unwrap();
        assert!(engine.list_managed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exec_captures_output_and_exit_code() {
        let engine = ProcessEngine::new();
        let handle = engine.launch(&spec(&["sleep", "30"])).await.unwrap();

        let result = engine
            .exec(
                &handle,
                &Invocation::new("sh")
                    .args(["-c", "echo $GREETING; exit 3"])
                    .env("GREETING", "hello"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "hello");

        engine.kill(&handle).await.unwrap();
        engine.reap(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let engine = ProcessEngine::new();
        let err = engine
            .launch(&spec(&["definitely-not-a-real-binary-nb"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), neural_bridge_core::ErrorKind::ProcessSpawnFailed);
    }
}
