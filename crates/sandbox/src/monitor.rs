//! Background health supervision.
//!
//! Probes every live sandbox on a fixed interval, applies the configured
//! degraded policy, and periodically sweeps for orphans. Sandboxes held by
//! an in-flight request are always stopped, never restarted.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use neural_bridge_core::config::DegradedPolicy;
use neural_bridge_core::SandboxStatus;

use crate::supervisor::Supervisor;

/// What one monitor pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub probed: usize,
    pub stopped: usize,
    pub restarted: usize,
    pub reclaimed: usize,
}

pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    interval: Duration,
    orphan_sweep_every: u32,
    policy: DegradedPolicy,
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the loop to exit and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Health monitor task ended abnormally");
        }
    }
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let config = supervisor.config().clone();
        Self {
            supervisor,
            interval: Duration::from_secs(config.monitor_interval_secs),
            orphan_sweep_every: config.orphan_sweep_every.max(1),
            policy: config.degraded_policy,
        }
    }

    pub fn with_policy(mut self, policy: DegradedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start the loop on the current runtime.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.interval.as_secs(),
                policy = ?self.policy,
                "Health monitor started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut n: u64 = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        n += 1;
                        let report = self.tick(n).await;
                        if report != TickReport::default() {
                            tracing::debug!(?report, "Health monitor pass");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Health monitor stopped");
        });
        MonitorHandle { shutdown, task }
    }

    /// Run pass number `n`.
    pub async fn tick(&self, n: u64) -> TickReport {
        let mut report = TickReport::default();

        for instance in self.supervisor.list().await {
            if !matches!(
                instance.status,
                SandboxStatus::Healthy | SandboxStatus::Degraded
            ) {
                continue;
            }
            let health = match self.supervisor.health_check(&instance.id).await {
                Ok(health) => health,
                // Stopped between list and probe.
                Err(_) => continue,
            };
            report.probed += 1;

            if health.status != SandboxStatus::Degraded {
                continue;
            }
            // A request holding the sandbox would never see a replacement;
            // stop it and let that request fail.
            let policy = match self.policy {
                DegradedPolicy::Restart if self.supervisor.is_held(&instance.id) => {
                    tracing::warn!(sandbox_id = %instance.id, "Degraded sandbox is in use by a request; stopping instead of restarting");
                    DegradedPolicy::Stop
                }
                policy => policy,
            };
            match policy {
                DegradedPolicy::Stop => match self.supervisor.stop_sandbox(&instance.id).await {
                    Ok(()) => report.stopped += 1,
                    Err(e) => {
                        tracing::error!(sandbox_id = %instance.id, error = %e, "Failed to stop degraded sandbox")
                    }
                },
                DegradedPolicy::Restart => match self.supervisor.restart_sandbox(&instance.id).await {
                    Ok(replacement) => {
                        tracing::info!(old = %instance.id, new = %replacement.id, "Degraded sandbox replaced");
                        report.restarted += 1;
                    }
                    Err(e) => {
                        tracing::error!(sandbox_id = %instance.id, error = %e, "Failed to restart degraded sandbox")
                    }
                },
            }
        }

        if n % u64::from(self.orphan_sweep_every) == 0 {
            report.reclaimed = self.supervisor.cleanup_orphaned().await.len();
        }
        report
    }
}
