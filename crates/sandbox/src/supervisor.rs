//! Sandbox supervisor.
//!
//! Owns every `SandboxInstance` and is the only writer of its status. Each
//! successful `create_sandbox` is matched by exactly one port release, whether
//! through `stop_sandbox`, a failed startup, a cancelled provisioning future,
//! or orphan cleanup.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use neural_bridge_core::config::{EngineConfig, ProbeKind, SupervisorConfig};
use neural_bridge_core::{
    Error, EventEmitter, EventEnvelope, EventSeverity, EventType, HealthStatus, NoOpEventEmitter,
    Result, SandboxId, SandboxInstance, SandboxStatus, ToolKind,
};

use crate::engine::{LaunchSpec, SandboxEngine};
use crate::ports::PortAllocator;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct SandboxRecord {
    instance: SandboxInstance,
    probe: ProbeKind,
    consecutive_failures: u32,
}

impl SandboxRecord {
    fn transition(&mut self, next: SandboxStatus) -> bool {
        let current = self.instance.status;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            tracing::warn!(
                sandbox_id = %self.instance.id,
                from = ?current,
                to = ?next,
                "Illegal sandbox status transition ignored"
            );
            return false;
        }
        tracing::debug!(sandbox_id = %self.instance.id, from = ?current, to = ?next, "Sandbox status changed");
        self.instance.status = next;
        true
    }

    fn health(&self, healthy: bool) -> HealthStatus {
        HealthStatus {
            id: self.instance.id.clone(),
            status: self.instance.status,
            healthy,
            consecutive_failures: self.consecutive_failures,
            checked_at: self.instance.last_health_check_at.unwrap_or_else(Utc::now),
        }
    }
}

type Records = Arc<DashMap<SandboxId, Arc<Mutex<SandboxRecord>>>>;

pub struct Supervisor {
    engine: Arc<dyn SandboxEngine>,
    ports: Arc<PortAllocator>,
    config: SupervisorConfig,
    profiles: EngineConfig,
    records: Records,
    /// Ids between port allocation and record insertion.
    provisioning: Arc<DashSet<SandboxId>>,
    /// Ids an in-flight request is executing on.
    held: Arc<DashSet<SandboxId>>,
    events: Arc<dyn EventEmitter>,
}

impl Supervisor {
    pub fn new(
        engine: Arc<dyn SandboxEngine>,
        ports: Arc<PortAllocator>,
        config: SupervisorConfig,
        profiles: EngineConfig,
    ) -> Self {
        Self {
            engine,
            ports,
            config,
            profiles,
            records: Arc::new(DashMap::new()),
            provisioning: Arc::new(DashSet::new()),
            held: Arc::new(DashSet::new()),
            events: Arc::new(NoOpEventEmitter),
        }
    }

    /// Set an event emitter for lifecycle events.
    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.events = emitter;
        self
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Provision a sandbox and wait (bounded by the startup timeout) for its
    /// first successful health probe.
    ///
    /// On timeout or launch failure the instance is torn down and its port
    /// released before the error is returned. Dropping the returned future
    /// mid-flight, including during that teardown, reclaims everything in the
    /// background.
    pub async fn create_sandbox(&self, tool_kind: ToolKind, owner_id: &str) -> Result<SandboxInstance> {
        let id = SandboxId::new();
        let port = self.ports.allocate(&id).await?;
        let mut guard = ProvisionGuard::new(
            self.engine.clone(),
            self.ports.clone(),
            self.records.clone(),
            self.provisioning.clone(),
            id.clone(),
            port,
        );

        let profile = self.profiles.profile(tool_kind).clone();
        let probe = profile.probe;
        let spec = LaunchSpec {
            sandbox_id: id.clone(),
            tool_kind,
            port,
            profile,
        };

        let handle = match self.engine.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.provisioning.remove(&id);
                self.ports.release_held(port, &id).await;
                guard.disarm();
                tracing::error!(sandbox_id = %id, tool = %tool_kind, port = port, error = %e, "Sandbox launch failed");
                return Err(e);
            }
        };
        guard.set_handle(handle.clone());

        let record = Arc::new(Mutex::new(SandboxRecord {
            instance: SandboxInstance {
                id: id.clone(),
                tool_kind,
                owner_id: owner_id.to_string(),
                assigned_port: port,
                status: SandboxStatus::Starting,
                handle: handle.clone(),
                created_at: Utc::now(),
                last_health_check_at: None,
            },
            probe,
            consecutive_failures: 0,
        }));
        self.records.insert(id.clone(), record.clone());
        self.provisioning.remove(&id);
        self.update_gauge();

        tracing::info!(
            sandbox_id = %id,
            tool = %tool_kind,
            port = port,
            engine = self.engine.name(),
            "Sandbox launched; waiting for first healthy probe"
        );

        let startup = self.config.startup_timeout();
        let outcome = tokio::time::timeout(startup, self.await_first_healthy(&record)).await;

        let (error, reason) = match outcome {
            Ok(Ok(instance)) => {
                guard.disarm();
                self.events
                    .emit(EventEnvelope::sandbox(EventType::SandboxCreated, &instance, None))
                    .await;
                tracing::info!(sandbox_id = %id, port = port, "Sandbox healthy");
                return Ok(instance);
            }
            Ok(Err(e)) => {
                tracing::warn!(sandbox_id = %id, error = %e, "Sandbox failed during startup");
                (e, "startup_failed")
            }
            Err(_) => {
                tracing::warn!(sandbox_id = %id, timeout_secs = startup.as_secs(), "Sandbox startup timed out");
                let error = Error::StartupTimeout {
                    id: id.to_string(),
                    timeout_secs: startup.as_secs(),
                };
                (error, "startup_timeout")
            }
        };

        // The guard stays armed until teardown has finished.
        if let Err(e) = self.teardown(&record, reason).await {
            tracing::warn!(sandbox_id = %id, reason = reason, error = %e, "Teardown after failed startup reported an error");
        }
        guard.disarm();
        Err(error)
    }

    async fn await_first_healthy(&self, record: &Arc<Mutex<SandboxRecord>>) -> Result<SandboxInstance> {
        let (handle, port, probe) = {
            let rec = record.lock().await;
            (rec.instance.handle.clone(), rec.instance.assigned_port, rec.probe)
        };

        loop {
            let outcome = self
                .engine
                .probe(&handle, port, probe, self.config.probe_timeout())
                .await;
            {
                let mut rec = record.lock().await;
                if rec.instance.status != SandboxStatus::Starting {
                    return Err(Error::internal(format!(
                        "sandbox {} was stopped during startup",
                        rec.instance.id
                    )));
                }
                rec.instance.last_health_check_at = Some(Utc::now());
                if outcome.is_ok() {
                    rec.consecutive_failures = 0;
                    rec.transition(SandboxStatus::Healthy);
                    return Ok(rec.instance.clone());
                }
            }

            if let Ok(false) = self.engine.is_running(&handle).await {
                return Err(Error::spawn_failed(format!(
                    "sandbox process {} exited during startup",
                    handle
                )));
            }
            tokio::time::sleep(self.config.health_poll_interval()).await;
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Probe one sandbox. `health_failure_threshold` consecutive failures
    /// flip a healthy sandbox to `Degraded`; a success flips it back.
    pub async fn health_check(&self, id: &SandboxId) -> Result<HealthStatus> {
        let record = self
            .record(id)
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))?;

        let (handle, port, probe) = {
            let rec = record.lock().await;
            match rec.instance.status {
                SandboxStatus::Healthy | SandboxStatus::Degraded => {}
                _ => return Ok(rec.health(false)),
            }
            (rec.instance.handle.clone(), rec.instance.assigned_port, rec.probe)
        };

        let outcome = self
            .engine
            .probe(&handle, port, probe, self.config.probe_timeout())
            .await;

        let mut degraded = None;
        let status = {
            let mut rec = record.lock().await;
            if rec.instance.status.is_terminal() {
                return Ok(rec.health(false));
            }
            rec.instance.last_health_check_at = Some(Utc::now());
            match &outcome {
                Ok(()) => {
                    rec.consecutive_failures = 0;
                    if rec.instance.status == SandboxStatus::Degraded {
                        rec.transition(SandboxStatus::Healthy);
                        tracing::info!(sandbox_id = %id, "Sandbox recovered");
                    }
                }
                Err(e) => {
                    rec.consecutive_failures += 1;
                    tracing::debug!(
                        sandbox_id = %id,
                        failures = rec.consecutive_failures,
                        error = %e,
                        "Health probe failed"
                    );
                    if rec.consecutive_failures >= self.config.health_failure_threshold
                        && rec.instance.status == SandboxStatus::Healthy
                    {
                        rec.transition(SandboxStatus::Degraded);
                        tracing::warn!(
                            sandbox_id = %id,
                            failures = rec.consecutive_failures,
                            "Sandbox degraded"
                        );
                        degraded = Some(rec.instance.clone());
                    }
                }
            }
            rec.health(outcome.is_ok())
        };

        if let Some(instance) = degraded {
            self.events
                .emit(
                    EventEnvelope::sandbox(EventType::SandboxDegraded, &instance, Some("health_probe_failures"))
                        .with_severity(EventSeverity::Warning),
                )
                .await;
        }
        Ok(status)
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Stop a sandbox: graceful signal, bounded wait, force kill, then port
    /// release. Stopping an unknown or already stopped id is a no-op.
    pub async fn stop_sandbox(&self, id: &SandboxId) -> Result<()> {
        match self.record(id) {
            Some(record) => self.teardown(&record, "stopped").await,
            None => {
                tracing::debug!(sandbox_id = %id, "Stop requested for absent sandbox; nothing to do");
                Ok(())
            }
        }
    }

    /// Stop every sandbox owned by `owner_id`. Returns the ids stopped.
    pub async fn stop_owned_by(&self, owner_id: &str) -> Vec<SandboxId> {
        let owned: Vec<SandboxId> = self
            .list()
            .await
            .into_iter()
            .filter(|i| i.owner_id == owner_id)
            .map(|i| i.id)
            .collect();

        for id in &owned {
            if let Err(e) = self.stop_sandbox(id).await {
                tracing::error!(sandbox_id = %id, error = %e, "Failed to stop sandbox for departing owner");
            }
        }
        if !owned.is_empty() {
            tracing::info!(owner_id = %owner_id, count = owned.len(), "Stopped sandboxes for owner");
        }
        owned
    }

    /// Stop a degraded sandbox and start a replacement for the same tool and owner.
    ///
    /// Sandboxes held by a request are refused: nothing would hand the
    /// replacement back to that request. Stop those instead.
    pub async fn restart_sandbox(&self, id: &SandboxId) -> Result<SandboxInstance> {
        let instance = self
            .get(id)
            .await
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))?;
        if self.is_held(id) {
            return Err(Error::internal(format!(
                "sandbox {} is held by an in-flight request and cannot be restarted",
                id
            )));
        }
        self.stop_sandbox(id).await?;
        tracing::info!(sandbox_id = %id, tool = %instance.tool_kind, "Restarting sandbox");
        self.create_sandbox(instance.tool_kind, &instance.owner_id).await
    }

    /// Stop everything. Used on process exit.
    pub async fn shutdown(&self) {
        let ids: Vec<SandboxId> = self.records.iter().map(|r| r.key().clone()).collect();
        tracing::info!(count = ids.len(), "Supervisor shutting down sandboxes");
        for id in ids {
            if let Err(e) = self.stop_sandbox(&id).await {
                tracing::error!(sandbox_id = %id, error = %e, "Failed to stop sandbox during shutdown");
            }
        }
    }

    async fn teardown(&self, record: &Arc<Mutex<SandboxRecord>>, reason: &str) -> Result<()> {
        let mut rec = record.lock().await;
        if rec.instance.status == SandboxStatus::Stopped {
            return Ok(());
        }
        rec.transition(SandboxStatus::Stopping);

        let handle = rec.instance.handle.clone();
        let outcome = self.terminate(&handle).await;

        // Released on every path, including a failed kill.
        self.forget(&mut rec).await;

        tracing::info!(
            sandbox_id = %rec.instance.id,
            port = rec.instance.assigned_port,
            reason = reason,
            "Sandbox stopped"
        );
        self.events
            .emit(EventEnvelope::sandbox(EventType::SandboxStopped, &rec.instance, Some(reason)))
            .await;
        outcome
    }

    async fn terminate(&self, handle: &str) -> Result<()> {
        if let Err(e) = self.engine.signal_stop(handle).await {
            tracing::warn!(handle = %handle, error = %e, "Graceful stop signal failed");
        }

        let deadline = tokio::time::Instant::now() + self.config.stop_grace();
        let mut exited = false;
        loop {
            match self.engine.is_running(handle).await {
                Ok(false) => {
                    exited = true;
                    break;
                }
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!(handle = %handle, error = %e, "Could not confirm sandbox exit");
                    break;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        let mut outcome = Ok(());
        if !exited {
            tracing::warn!(handle = %handle, "Sandbox did not exit within grace period; killing");
            if let Err(e) = self.engine.kill(handle).await {
                tracing::error!(handle = %handle, error = %e, "Force kill failed");
                outcome = Err(e);
            }
        }
        if let Err(e) = self.engine.reap(handle).await {
            tracing::warn!(handle = %handle, error = %e, "Failed to reap sandbox unit");
        }
        outcome
    }

    // =========================================================================
    // Orphans
    // =========================================================================

    /// Reclaim sandboxes whose backing unit is gone, finish stops whose
    /// caller went away, and remove labelled units nothing tracks (e.g. left
    /// over from a previous run).
    pub async fn cleanup_orphaned(&self) -> Vec<SandboxId> {
        let mut reclaimed = Vec::new();

        let records: Vec<Arc<Mutex<SandboxRecord>>> =
            self.records.iter().map(|r| r.value().clone()).collect();
        for record in records {
            // A locked record is being worked on (a stop in progress holds
            // the lock throughout).
            let Ok(rec) = record.try_lock() else {
                continue;
            };
            let (handle, status) = (rec.instance.handle.clone(), rec.instance.status);
            if status == SandboxStatus::Stopping {
                if let Some(id) = self.finish_abandoned_stop(rec).await {
                    reclaimed.push(id);
                }
                continue;
            }
            drop(rec);
            if status == SandboxStatus::Starting || status.is_terminal() {
                continue;
            }
            match self.engine.is_running(&handle).await {
                Ok(false) => {
                    if let Some(id) = self.reclaim(&record).await {
                        reclaimed.push(id);
                    }
                }
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!(handle = %handle, error = %e, "Orphan check failed");
                }
            }
        }

        match self.engine.list_managed().await {
            Ok(units) => {
                for unit in units {
                    let tracked = unit.sandbox_id.as_ref().is_some_and(|id| {
                        self.records.contains_key(id) || self.provisioning.contains(id)
                    });
                    if tracked {
                        continue;
                    }
                    if unit.running {
                        if let Err(e) = self.engine.kill(&unit.handle).await {
                            tracing::warn!(handle = %unit.handle, error = %e, "Failed to kill untracked unit");
                            continue;
                        }
                    }
                    if let Err(e) = self.engine.reap(&unit.handle).await {
                        tracing::warn!(handle = %unit.handle, error = %e, "Failed to remove untracked unit");
                        continue;
                    }
                    tracing::info!(handle = %unit.handle, port = ?unit.port, "Removed untracked sandbox unit");
                    if let Some(id) = unit.sandbox_id {
                        reclaimed.push(id);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list managed units");
            }
        }

        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "Orphaned sandboxes reclaimed");
        }
        reclaimed
    }

    async fn reclaim(&self, record: &Arc<Mutex<SandboxRecord>>) -> Option<SandboxId> {
        let mut rec = record.lock().await;
        if rec.instance.status.is_terminal() || rec.instance.status == SandboxStatus::Starting {
            return None;
        }
        rec.transition(SandboxStatus::Stopping);
        if let Err(e) = self.engine.reap(&rec.instance.handle).await {
            tracing::warn!(sandbox_id = %rec.instance.id, error = %e, "Failed to reap orphaned unit");
        }
        self.forget(&mut rec).await;

        tracing::warn!(sandbox_id = %rec.instance.id, port = rec.instance.assigned_port, "Sandbox unit vanished; reclaimed");
        self.events
            .emit(
                EventEnvelope::sandbox(EventType::SandboxReclaimed, &rec.instance, Some("orphaned"))
                    .with_severity(EventSeverity::Warning),
            )
            .await;
        Some(rec.instance.id.clone())
    }

    /// Teardown holds the record lock until it finishes, so a `Stopping`
    /// record whose lock was free was left by a cancelled stop.
    async fn finish_abandoned_stop(&self, mut rec: MutexGuard<'_, SandboxRecord>) -> Option<SandboxId> {
        let handle = rec.instance.handle.clone();
        match self.engine.is_running(&handle).await {
            Ok(false) => {}
            Ok(true) | Err(_) => {
                if let Err(e) = self.engine.kill(&handle).await {
                    tracing::warn!(sandbox_id = %rec.instance.id, error = %e, "Kill of abandoned sandbox failed");
                }
            }
        }
        if let Err(e) = self.engine.reap(&handle).await {
            tracing::warn!(sandbox_id = %rec.instance.id, error = %e, "Failed to reap abandoned sandbox unit");
        }
        self.forget(&mut rec).await;

        tracing::warn!(sandbox_id = %rec.instance.id, port = rec.instance.assigned_port, "Interrupted stop finished by cleanup");
        self.events
            .emit(
                EventEnvelope::sandbox(EventType::SandboxReclaimed, &rec.instance, Some("stop_interrupted"))
                    .with_severity(EventSeverity::Warning),
            )
            .await;
        Some(rec.instance.id.clone())
    }

    /// Release the port and drop the record. The caller holds the record lock.
    async fn forget(&self, rec: &mut SandboxRecord) {
        self.ports
            .release_held(rec.instance.assigned_port, &rec.instance.id)
            .await;
        rec.transition(SandboxStatus::Stopped);
        self.records.remove(&rec.instance.id);
        self.held.remove(&rec.instance.id);
        self.update_gauge();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, id: &SandboxId) -> Option<SandboxInstance> {
        let record = self.record(id)?;
        let rec = record.lock().await;
        Some(rec.instance.clone())
    }

    /// Snapshot of every live sandbox.
    pub async fn list(&self) -> Vec<SandboxInstance> {
        let records: Vec<Arc<Mutex<SandboxRecord>>> =
            self.records.iter().map(|r| r.value().clone()).collect();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(record.lock().await.instance.clone());
        }
        out.sort_by_key(|i| i.assigned_port);
        out
    }

    pub fn active_count(&self) -> usize {
        self.records.len()
    }

    /// Mark a sandbox as in use by a request until it is stopped.
    pub fn hold(&self, id: &SandboxId) {
        if self.records.contains_key(id) {
            self.held.insert(id.clone());
        }
    }

    pub fn is_held(&self, id: &SandboxId) -> bool {
        self.held.contains(id)
    }

    fn record(&self, id: &SandboxId) -> Option<Arc<Mutex<SandboxRecord>>> {
        self.records.get(id).map(|r| r.value().clone())
    }

    fn update_gauge(&self) {
        metrics::gauge!("nb_sandboxes_active").set(self.records.len() as f64);
    }
}

// =============================================================================
// Provision Guard
// =============================================================================

/// Reclaims a half-provisioned sandbox if `create_sandbox` is dropped before
/// it settles.
struct ProvisionGuard {
    engine: Arc<dyn SandboxEngine>,
    ports: Arc<PortAllocator>,
    records: Records,
    provisioning: Arc<DashSet<SandboxId>>,
    id: SandboxId,
    port: u16,
    handle: Option<String>,
    armed: bool,
}

impl ProvisionGuard {
    fn new(
        engine: Arc<dyn SandboxEngine>,
        ports: Arc<PortAllocator>,
        records: Records,
        provisioning: Arc<DashSet<SandboxId>>,
        id: SandboxId,
        port: u16,
    ) -> Self {
        provisioning.insert(id.clone());
        Self {
            engine,
            ports,
            records,
            provisioning,
            id,
            port,
            handle: None,
            armed: true,
        }
    }

    fn set_handle(&mut self, handle: String) {
        self.handle = Some(handle);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProvisionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(sandbox_id = %self.id, port = self.port, "No runtime to reclaim cancelled sandbox");
            return;
        };

        let engine = self.engine.clone();
        let ports = self.ports.clone();
        let records = self.records.clone();
        let provisioning = self.provisioning.clone();
        let id = self.id.clone();
        let port = self.port;
        let handle = self.handle.take();

        runtime.spawn(async move {
            if let Some(handle) = handle {
                if let Err(e) = engine.kill(&handle).await {
                    tracing::warn!(handle = %handle, error = %e, "Kill of cancelled sandbox failed");
                }
                if let Err(e) = engine.reap(&handle).await {
                    tracing::warn!(handle = %handle, error = %e, "Reap of cancelled sandbox failed");
                }
            }
            records.remove(&id);
            provisioning.remove(&id);
            ports.release_held(port, &id).await;
            tracing::warn!(sandbox_id = %id, port = port, "Sandbox provisioning cancelled; resources reclaimed");
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use neural_bridge_core::mocks::RecordingEventEmitter;

    fn supervisor_with(
        engine: Arc<MockEngine>,
        pool: (u16, u16),
    ) -> (Supervisor, Arc<RecordingEventEmitter>) {
        let events = Arc::new(RecordingEventEmitter::new());
        let ports = Arc::new(PortAllocator::new(pool.0, pool.1).unwrap());
        let supervisor = Supervisor::new(
            engine,
            ports,
            SupervisorConfig::default(),
            EngineConfig::default(),
        )
        .with_event_emitter(events.clone());
        (supervisor, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_waits_for_healthy() {
        let engine = Arc::new(MockEngine::new());
        engine.script_probes([false, false, true]);
        let (supervisor, events) = supervisor_with(engine.clone(), (50000, 50009));

        let instance = supervisor
            .create_sandbox(ToolKind::CodeGen, "sess-1")
            .await
            .unwrap();
        assert_eq!(instance.status, SandboxStatus::Healthy);
        assert_eq!(instance.assigned_port, 50000);
        assert_eq!(instance.owner_id, "sess-1");
        assert!(instance.last_health_check_at.is_some());
        assert_eq!(events.count(EventType::SandboxCreated), 1);
        assert_eq!(supervisor.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout_releases_port() {
        let engine = Arc::new(MockEngine::new());
        engine.set_healthy(false);
        let (supervisor, events) = supervisor_with(engine.clone(), (50000, 50009));

        let err = supervisor
            .create_sandbox(ToolKind::MultiAgentFlow, "sess-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StartupTimeout { timeout_secs: 30, .. }));
        assert_eq!(supervisor.ports().available().await, 10);
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(engine.running_units(), 0);
        assert_eq!(events.count(EventType::SandboxStopped), 1);
        assert_eq!(events.count(EventType::SandboxCreated), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_releases_port() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next_launches(1);
        let (supervisor, _) = supervisor_with(engine.clone(), (50000, 50009));

        let err = supervisor
            .create_sandbox(ToolKind::CodeGen, "sess-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), neural_bridge_core::ErrorKind::ProcessSpawnFailed);
        assert_eq!(supervisor.ports().available().await, 10);
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_pool_exhausted_never_launches() {
        let engine = Arc::new(MockEngine::new());
        let (supervisor, _) = supervisor_with(engine.clone(), (50000, 50000));

        supervisor.create_sandbox(ToolKind::CodeGen, "a").await.unwrap();
        let err = supervisor
            .create_sandbox(ToolKind::CodeGen, "b")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { capacity: 1 }));
        assert_eq!(engine.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_degraded_after_threshold_and_recovery() {
        let engine = Arc::new(MockEngine::new());
        let (supervisor, events) = supervisor_with(engine.clone(), (50000, 50009));
        let instance = supervisor
            .create_sandbox(ToolKind::CodeGen, "sess-1")
            .await
            .unwrap();

        engine.set_healthy(false);
        let first = supervisor.health_check(&instance.id).await.unwrap();
        assert_eq!(first.status, SandboxStatus::Healthy);
        assert_eq!(first.consecutive_failures, 1);
        let second = supervisor.health_check(&instance.id).await.unwrap();
        assert_eq!(second.status, SandboxStatus::Healthy);
        let third = supervisor.health_check(&instance.id).await.unwrap();
        assert_eq!(third.status, SandboxStatus::Degraded);
        assert!(!third.healthy);
        assert_eq!(events.count(EventType::SandboxDegraded), 1);

        engine.set_healthy(true);
        let recovered = supervisor.health_check(&instance.id).await.unwrap();
        assert_eq!(recovered.status, SandboxStatus::Healthy);
        assert_eq!(recovered.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_health_check_unknown_sandbox() {
        let engine = Arc::new(MockEngine::new());
        let (supervisor, _) = supervisor_with(engine, (50000, 50009));
        let err = supervisor.health_check(&SandboxId::from("nb-missing")).await.unwrap_err();
        assert!(matches!(err, Error::SandboxNotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let engine = Arc::new(MockEngine::new());
        let (supervisor, events) = supervisor_with(engine.clone(), (50000, 50009));
        let instance = supervisor
            .create_sandbox(ToolKind::CodeGen, "sess-1")
            .await
            .unwrap();

        supervisor.stop_sandbox(&instance.id).await.unwrap();
        supervisor.stop_sandbox(&instance.id).await.unwrap();

        assert_eq!(supervisor.ports().available().await, 10);
        assert_eq!(events.count(EventType::SandboxStopped), 1);
        assert_eq!(engine.reap_count(), 1);
        assert!(supervisor.get(&instance.id).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_stops_release_once() {
        let engine = Arc::new(MockEngine::new());
        let (supervisor, events) = supervisor_with(engine.clone(), (50000, 50009));
        let supervisor = Arc::new(supervisor);
        let instance = supervisor
            .create_sandbox(ToolKind::CodeGen, "sess-1")
            .await
            .unwrap();

        let a = {
            let s = supervisor.clone();
            let id = instance.id.clone();
            tokio::spawn(async move { s.stop_sandbox(&id).await })
        };
        let b = {
            let s = supervisor.clone();
            let id = instance.id.clone();
            tokio::spawn(async move { s.stop_sandbox(&id).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(events.count(EventType::SandboxStopped), 1);
        assert_eq!(supervisor.ports().available().await, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_force_kills_after_grace() {
        let engine = Arc::new(MockEngine::new());
        engine.ignore_sigterm(true);
        let (supervisor, _) = supervisor_with(engine.clone(), (50000, 50009));
        let instance = supervisor
            .create_sandbox(ToolKind::CodeGen, "sess-1")
            .await
            .unwrap();

        supervisor.stop_sandbox(&instance.id).await.unwrap();
        assert_eq!(engine.kill_count(), 1);
        assert_eq!(engine.running_units(), 0);
        assert_eq!(supervisor.ports().available().await, 10);
    }

    #[tokio::test]
    async fn test_cleanup_orphaned() {
        let engine = Arc::new(MockEngine::new());
        let (supervisor, events) = supervisor_with(engine.clone(), (50000, 50009));
        let alive = supervisor.create_sandbox(ToolKind::CodeGen, "a").await.unwrap();
        let dead = supervisor.create_sandbox(ToolKind::CodeGen, "b").await.unwrap();
        let foreign = SandboxId::from("nb-from-previous-run");
        engine.inject_foreign_unit(foreign.clone(), 50042);

        engine.crash(&dead.handle);
        let mut reclaimed = supervisor.cleanup_orphaned().await;
        reclaimed.sort();

        let mut expected = vec![dead.id.clone(), foreign];
        expected.sort();
        assert_eq!(reclaimed, expected);
        assert_eq!(events.count(EventType::SandboxReclaimed), 1);
        assert!(supervisor.get(&alive.id).await.is_some());
        assert_eq!(supervisor.ports().available().await, 9);
        assert_eq!(engine.running_units(), 1);

        assert!(supervisor.cleanup_orphaned().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_owned_by() {
        let engine = Arc::new(MockEngine::new());
        let (supervisor, _) = supervisor_with(engine.clone(), (50000, 50009));
        supervisor.create_sandbox(ToolKind::CodeGen, "a").await.unwrap();
        supervisor.create_sandbox(ToolKind::MultiAgentFlow, "a").await.unwrap();
        let other = supervisor.create_sandbox(ToolKind::CodeGen, "b").await.unwrap();

        let stopped = supervisor.stop_owned_by("a").await;
        assert_eq!(stopped.len(), 2);
        let remaining = supervisor.list().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, other.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_create_reclaims_resources() {
        let engine = Arc::new(MockEngine::new());
        engine.set_healthy(false);
        let (supervisor, _) = supervisor_with(engine.clone(), (50000, 50009));
        let supervisor = Arc::new(supervisor);

        let task = {
            let s = supervisor.clone();
            tokio::spawn(async move { s.create_sandbox(ToolKind::CodeGen, "sess-1").await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(supervisor.ports().available().await, 9);

        task.abort();
        let _ = task.await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(supervisor.ports().available().await, 10);
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(engine.running_units(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_startup_teardown_reclaims_resources() {
        let engine = Arc::new(MockEngine::new());
        engine.set_healthy(false);
        engine.ignore_sigterm(true);
        let (supervisor, _) = supervisor_with(engine.clone(), (50000, 50009));
        let supervisor = Arc::new(supervisor);

        let task = {
            let s = supervisor.clone();
            tokio::spawn(async move { s.create_sandbox(ToolKind::CodeGen, "sess-1").await })
        };
        // Startup times out at 30s; the 10s stop grace is still running at 31s.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(supervisor.ports().available().await, 9);

        task.abort();
        let _ = task.await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(supervisor.ports().available().await, 10);
        assert_eq!(engine.running_units(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_finishes_interrupted_stop() {
        let engine = Arc::new(MockEngine::new());
        engine.ignore_sigterm(true);
        let (supervisor, events) = supervisor_with(engine.clone(), (50000, 50009));
        let supervisor = Arc::new(supervisor);
        let instance = supervisor.create_sandbox(ToolKind::CodeGen, "sess-1").await.unwrap();

        let stop = {
            let s = supervisor.clone();
            let id = instance.id.clone();
            tokio::spawn(async move { s.stop_sandbox(&id).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        stop.abort();
        let _ = stop.await;

        let stuck = supervisor.get(&instance.id).await.unwrap();
        assert_eq!(stuck.status, SandboxStatus::Stopping);
        assert_eq!(supervisor.ports().available().await, 9);

        let reclaimed = supervisor.cleanup_orphaned().await;
        assert_eq!(reclaimed, vec![instance.id.clone()]);
        assert_eq!(events.count(EventType::SandboxReclaimed), 1);
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(supervisor.ports().available().await, 10);
        assert_eq!(engine.running_units(), 0);
        assert!(supervisor.cleanup_orphaned().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_skips_stop_in_progress() {
        let engine = Arc::new(MockEngine::new());
        engine.ignore_sigterm(true);
        let (supervisor, _) = supervisor_with(engine.clone(), (50000, 50009));
        let supervisor = Arc::new(supervisor);
        let instance = supervisor.create_sandbox(ToolKind::CodeGen, "sess-1").await.unwrap();

        let stop = {
            let s = supervisor.clone();
            let id = instance.id.clone();
            tokio::spawn(async move { s.stop_sandbox(&id).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(supervisor.cleanup_orphaned().await.is_empty());
        assert_eq!(engine.kill_count(), 0);

        stop.await.unwrap().unwrap();
        assert_eq!(engine.kill_count(), 1);
        assert_eq!(supervisor.ports().available().await, 10);
    }

    #[tokio::test]
    async fn test_concurrent_creates_never_share_ports() {
        let engine = Arc::new(MockEngine::new());
        let (supervisor, _) = supervisor_with(engine.clone(), (50000, 50009));
        let supervisor = Arc::new(supervisor);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let s = supervisor.clone();
            tasks.push(tokio::spawn(async move {
                s.create_sandbox(ToolKind::CodeGen, &format!("owner-{}", i)).await
            }));
        }
        let mut ok = 0;
        let mut exhausted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(Error::PoolExhausted { .. }) => exhausted += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!((ok, exhausted), (10, 10));

        let mut ports: Vec<u16> = supervisor.list().await.iter().map(|i| i.assigned_port).collect();
        ports.dedup();
        assert_eq!(ports.len(), 10);

        supervisor.shutdown().await;
        assert_eq!(supervisor.ports().available().await, 10);
    }

    #[tokio::test]
    async fn test_restart_refused_while_held() {
        let engine = Arc::new(MockEngine::new());
        let (supervisor, _) = supervisor_with(engine.clone(), (50000, 50009));
        let instance = supervisor.create_sandbox(ToolKind::CodeGen, "a").await.unwrap();
        supervisor.hold(&instance.id);
        assert!(supervisor.is_held(&instance.id));

        assert!(supervisor.restart_sandbox(&instance.id).await.is_err());
        assert_eq!(engine.launch_count(), 1);
        assert!(supervisor.get(&instance.id).await.is_some());

        supervisor.stop_sandbox(&instance.id).await.unwrap();
        assert!(!supervisor.is_held(&instance.id));
    }

    #[tokio::test]
    async fn test_restart_replaces_instance() {
        let engine = Arc::new(MockEngine::new());
        let (supervisor, _) = supervisor_with(engine.clone(), (50000, 50009));
        let original = supervisor.create_sandbox(ToolKind::MultiAgentFlow, "a").await.unwrap();

        let replacement = supervisor.restart_sandbox(&original.id).await.unwrap();
        assert_ne!(replacement.id, original.id);
        assert_eq!(replacement.tool_kind, ToolKind::MultiAgentFlow);
        assert_eq!(replacement.owner_id, "a");
        assert_eq!(supervisor.active_count(), 1);
    }
}
