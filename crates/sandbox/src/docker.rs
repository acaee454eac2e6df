//! Docker-backed sandbox engine using the `bollard` crate.
//!
//! Each sandbox is one container labelled `managed-by=neural-bridge`, with its
//! assigned port published on the loopback interface only.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use neural_bridge_core::config::{DockerLimits, ProbeKind};
use neural_bridge_core::{Error, Result, SandboxId};

use crate::engine::{
    probe_tcp, ExecResult, Invocation, LaunchSpec, ManagedUnit, SandboxEngine, MANAGED_BY,
};

const LABEL_MANAGED_BY: &str = "managed-by";
const LABEL_SANDBOX_ID: &str = "neural-bridge.sandbox-id";
const LABEL_PORT: &str = "neural-bridge.port";
const LABEL_TOOL: &str = "neural-bridge.tool";

/// Docker-based sandbox engine.
///
/// Containers get:
/// - Memory and CPU limits
/// - `no-new-privileges`
/// - The assigned port bound to `127.0.0.1` only
pub struct DockerEngine {
    docker: bollard::Docker,
    limits: DockerLimits,
}

impl DockerEngine {
    /// Connect to the local Docker daemon.
    pub fn new(limits: DockerLimits) -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            Error::internal(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self { docker, limits })
    }

    /// Create from an existing bollard Docker client (for testing).
    pub fn from_client(docker: bollard::Docker, limits: DockerLimits) -> Self {
        Self { docker, limits }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        use bollard::image::CreateImageOptions;
        use futures::TryStreamExt;

        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image = %image, "Pulling sandbox image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| Error::spawn_failed(format!("Failed to pull image '{}': {}", image, e)))?;
        Ok(())
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl SandboxEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::{HostConfig, PortBinding};

        if spec.profile.image.is_empty() {
            return Err(Error::config(format!(
                "no container image configured for {}",
                spec.tool_kind
            )));
        }
        self.ensure_image(&spec.profile.image).await?;

        let container_name = spec.sandbox_id.to_string();
        let port_key = format!("{}/tcp", spec.port);

        let host_config = HostConfig {
            memory: Some(self.limits.memory_limit_mb * 1024 * 1024),
            cpu_quota: Some(self.limits.cpu_quota),
            cpu_period: Some(100_000), // standard 100ms period
            network_mode: Some(self.limits.network_mode.clone()),
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(spec.port.to_string()),
                }]),
            )])),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            pids_limit: Some(512),
            ..Default::default()
        };

        let command = spec.command();
        let env: Vec<String> = spec
            .env()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let container_config = Config {
            image: Some(spec.profile.image.clone()),
            cmd: if command.is_empty() { None } else { Some(command) },
            env: Some(env),
            working_dir: spec.profile.workdir.clone(),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            labels: Some(HashMap::from([
                (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
                (LABEL_SANDBOX_ID.to_string(), spec.sandbox_id.to_string()),
                (LABEL_PORT.to_string(), spec.port.to_string()),
                (LABEL_TOOL.to_string(), spec.tool_kind.as_str().to_string()),
            ])),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| Error::spawn_failed(format!("Failed to create container: {}", e)))?;

        if let Err(e) = self.docker.start_container::<String>(&created.id, None).await {
            // Created but never started: remove it so the name and port are free again.
            let _ = self.reap(&created.id).await;
            return Err(Error::spawn_failed(format!(
                "Failed to start container: {}",
                e
            )));
        }

        tracing::info!(
            sandbox_id = %spec.sandbox_id,
            container = %created.id,
            image = %spec.profile.image,
            port = spec.port,
            "Sandbox container started"
        );

        Ok(created.id)
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
                "container {} is not running",
                handle
            )));
        }
        match kind {
            ProbeKind::Running => Ok(()),
            ProbeKind::Tcp => probe_tcp(port, timeout).await,
        }
    }

    async fn exec(&self, handle: &str, invocation: &Invocation, timeout: Duration) -> Result<ExecResult> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let mut cmd = vec![invocation.program.clone()];
        cmd.extend(invocation.args.iter().cloned());

        let exec_options = CreateExecOptions {
            cmd: Some(cmd),
            env: Some(
                invocation
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: invocation.workdir.clone(),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(handle, exec_options)
            .await
            .map_err(|e| Error::spawn_failed(format!("Failed to create exec in sandbox: {}", e)))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::spawn_failed(format!("Failed to start exec in sandbox: {}", e)))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            use futures::StreamExt;

            let collect_future = async {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            stderr.push_str(&format!("\n[sandbox error: {}]", e));
                            break;
                        }
                    }
                }
            };

            if tokio::time::timeout(timeout, collect_future).await.is_err() {
                tracing::warn!(container = %handle, program = %invocation.program, "Sandbox exec timed out");
                return Ok(ExecResult {
                    exit_code: -1,
                    stdout,
                    stderr: format!("{}\n[Execution timed out after {:?}]", stderr, timeout),
                    timed_out: true,
                });
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::internal(format!("Failed to inspect exec result: {}", e)))?;

        Ok(ExecResult {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
            timed_out: false,
        })
    }

    async fn signal_stop(&self, handle: &str) -> Result<()> {
        use bollard::container::KillContainerOptions;

        match self
            .docker
            .kill_container(handle, Some(KillContainerOptions { signal: "SIGTERM" }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::internal(format!(
                "Failed to signal container {}: {}",
                handle, e
            ))),
        }
    }

    async fn kill(&self, handle: &str) -> Result<()> {
        use bollard::container::KillContainerOptions;

        match self
            .docker
            .kill_container(handle, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            // 409: container is not running
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(Error::internal(format!(
                "Failed to kill container {}: {}",
                handle, e
            ))),
        }
    }

    async fn is_running(&self, handle: &str) -> Result<bool> {
        use bollard::container::InspectContainerOptions;

        match self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(Error::internal(format!(
                "Failed to inspect container {}: {}",
                handle, e
            ))),
        }
    }

    async fn reap(&self, handle: &str) -> Result<()> {
        use bollard::container::RemoveContainerOptions;

        match self
            .docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                tracing::debug!(container = %handle, "Sandbox container removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::internal(format!(
                "Failed to remove container {}: {}",
                handle, e
            ))),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ManagedUnit>> {
        use bollard::container::ListContainersOptions;

        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY)],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::internal(format!("Failed to list containers: {}", e)))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let handle = c.id?;
                let labels = c.labels.unwrap_or_default();
                Some(ManagedUnit {
                    handle,
                    sandbox_id: labels.get(LABEL_SANDBOX_ID).map(|s| SandboxId(s.clone())),
                    port: labels.get(LABEL_PORT).and_then(|p| p.parse().ok()),
                    running: c.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }
}
