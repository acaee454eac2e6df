//! Dual-mode orchestrator.
//!
//! Every request moves through
//! `Received → ModeResolved → {SingleDispatch | PlanFanOut} → Executing → Aggregating → Completed | Failed`
//! under one overall deadline. Sandboxes are scoped to the request: whatever
//! path the request takes, each sandbox it created is stopped before the
//! result is returned.

use async_trait::async_trait;
use dashmap::DashSet;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use neural_bridge_adapters::AdapterSet;
use neural_bridge_core::config::OrchestratorConfig;
use neural_bridge_core::{
    ErrorKind, EventEmitter, EventEnvelope, ExecutionMode, ExecutionRequest, ExecutionResult,
    NoOpEventEmitter, Orchestrator, SandboxId, SubResult, ToolKind, DUAL_MODE_TOOL,
};
use neural_bridge_sandbox::Supervisor;

use crate::coordination::{validate_plan, Assignment, CoordinationClient};

// =============================================================================
// Request Phases
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    ModeResolved,
    SingleDispatch,
    PlanFanOut,
    Executing,
    Aggregating,
    Completed,
    Failed,
}

struct RequestTrace {
    request_id: String,
    phase: RequestPhase,
}

impl RequestTrace {
    fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            phase: RequestPhase::Received,
        }
    }

    fn advance(&mut self, next: RequestPhase) {
        tracing::debug!(request_id = %self.request_id, from = ?self.phase, to = ?next, "Request phase");
        self.phase = next;
    }
}

// =============================================================================
// Sandbox Scope
// =============================================================================

/// Sandboxes owned by one in-flight request.
///
/// Tracked sandboxes are held in the supervisor, so the health monitor stops
/// rather than replaces them. Ids are removed only after their stop
/// completed, so a stop interrupted by the deadline is retried by `close`. If the scope is dropped without
/// `close` (the caller went away), the remaining stops run on a spawned task.
struct SandboxScope {
    supervisor: Arc<Supervisor>,
    live: DashSet<SandboxId>,
}

impl SandboxScope {
    fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            live: DashSet::new(),
        }
    }

    fn track(&self, id: SandboxId) {
        self.supervisor.hold(&id);
        self.live.insert(id);
    }

    async fn release(&self, id: &SandboxId) {
        if let Err(e) = self.supervisor.stop_sandbox(id).await {
            tracing::error!(sandbox_id = %id, error = %e, "Failed to stop request sandbox");
        }
        self.live.remove(id);
    }

    async fn close(self) {
        let remaining: Vec<SandboxId> = self.live.iter().map(|id| id.clone()).collect();
        if !remaining.is_empty() {
            tracing::info!(count = remaining.len(), "Stopping sandboxes left by interrupted request");
        }
        for id in remaining {
            self.release(&id).await;
        }
    }
}

impl Drop for SandboxScope {
    fn drop(&mut self) {
        let remaining: Vec<SandboxId> = self.live.iter().map(|id| id.clone()).collect();
        if remaining.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(count = remaining.len(), "No runtime to stop abandoned request sandboxes");
            return;
        };
        let supervisor = self.supervisor.clone();
        runtime.spawn(async move {
            for id in remaining {
                if let Err(e) = supervisor.stop_sandbox(&id).await {
                    tracing::error!(sandbox_id = %id, error = %e, "Failed to stop abandoned sandbox");
                }
            }
        });
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct DualModeOrchestrator {
    supervisor: Arc<Supervisor>,
    adapters: Arc<AdapterSet>,
    coordinator: Arc<dyn CoordinationClient>,
    config: OrchestratorConfig,
    max_subtask_chars: usize,
    events: Arc<dyn EventEmitter>,
}

impl DualModeOrchestrator {
    pub fn new(
        supervisor: Arc<Supervisor>,
        adapters: Arc<AdapterSet>,
        coordinator: Arc<dyn CoordinationClient>,
        config: OrchestratorConfig,
        max_subtask_chars: usize,
    ) -> Self {
        Self {
            supervisor,
            adapters,
            coordinator,
            config,
            max_subtask_chars,
            events: Arc::new(NoOpEventEmitter),
        }
    }

    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.events = emitter;
        self
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    /// Code generation always runs with an explicit sub-mode.
    fn resolve_codegen_mode(&self, mut request: ExecutionRequest, tool: ToolKind) -> ExecutionRequest {
        if tool == ToolKind::CodeGen && request.codegen_mode.is_none() {
            tracing::debug!(mode = self.config.default_codegen_mode.as_str(), "Using configured code generation mode");
            request.codegen_mode = Some(self.config.default_codegen_mode);
        }
        request
    }

    /// Provision, execute and stop one sandbox for `tool`.
    async fn run_on(
        &self,
        owner_id: &str,
        tool: ToolKind,
        request: ExecutionRequest,
        scope: &SandboxScope,
    ) -> ExecutionResult {
        let started = Instant::now();
        let instance = match self.supervisor.create_sandbox(tool, owner_id).await {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!(tool = %tool, error = %e, "Sandbox provisioning failed");
                return ExecutionResult::from_error(
                    tool.as_str(),
                    &e,
                    started.elapsed().as_millis() as u64,
                );
            }
        };
        scope.track(instance.id.clone());

        let result = self.adapters.get(tool).execute(&request, &instance).await;
        scope.release(&instance.id).await;
        result
    }

    async fn run_single(
        &self,
        owner_id: &str,
        request: ExecutionRequest,
        trace: &mut RequestTrace,
        scope: &SandboxScope,
    ) -> ExecutionResult {
        let tool = request.tool_hint.unwrap_or(self.config.default_tool);
        trace.advance(RequestPhase::SingleDispatch);
        let request = self.resolve_codegen_mode(request, tool);
        trace.advance(RequestPhase::Executing);
        self.run_on(owner_id, tool, request, scope).await
    }

    async fn run_dual(
        &self,
        owner_id: &str,
        request: ExecutionRequest,
        trace: &mut RequestTrace,
        scope: &SandboxScope,
        started: Instant,
    ) -> ExecutionResult {
        trace.advance(RequestPhase::PlanFanOut);
        let assignments = match self
            .coordinator
            .plan(&request.task_description)
            .await
            .and_then(|plan| validate_plan(plan, self.max_subtask_chars))
        {
            Ok(assignments) => assignments,
            Err(e) => {
                tracing::warn!(request_id = %trace.request_id, error = %e, "Dual-mode planning failed");
                return ExecutionResult::failure(
                    DUAL_MODE_TOOL,
                    ErrorKind::CoordinationUnavailable,
                    e.to_string(),
                    started.elapsed().as_millis() as u64,
                );
            }
        };
        tracing::info!(
            request_id = %trace.request_id,
            tools = ?assignments.iter().map(|a| a.tool.as_str()).collect::<Vec<_>>(),
            "Dual-mode plan accepted"
        );

        trace.advance(RequestPhase::Executing);
        let runs = assignments.into_iter().map(|Assignment { tool, task }| {
            let sub_request = self.resolve_codegen_mode(
                ExecutionRequest {
                    task_description: task,
                    mode: ExecutionMode::Single,
                    tool_hint: Some(tool),
                    codegen_mode: request.codegen_mode,
                    extra_args: Vec::new(),
                },
                tool,
            );
            async move { (tool, self.run_on(owner_id, tool, sub_request, scope).await) }
        });
        let results = join_all(runs).await;

        trace.advance(RequestPhase::Aggregating);
        aggregate(results, started.elapsed().as_millis() as u64)
    }
}

/// Merge sub-results: provenance-marked output, AND of successes, first failure's kind.
fn aggregate(results: Vec<(ToolKind, ExecutionResult)>, duration_ms: u64) -> ExecutionResult {
    let success = results.iter().all(|(_, r)| r.success);
    let error_kind = results
        .iter()
        .find(|(_, r)| !r.success)
        .and_then(|(_, r)| r.error_kind);
    let output = results
        .iter()
        .map(|(tool, r)| format!("=== [{}] ===\n{}", tool, r.output))
        .collect::<Vec<_>>()
        .join("\n\n");
    let sub_results = results
        .iter()
        .map(|(tool, r)| SubResult {
            tool: *tool,
            success: r.success,
            duration_ms: r.duration_ms,
            error_kind: r.error_kind,
        })
        .collect();

    ExecutionResult {
        success,
        output,
        tool_used: DUAL_MODE_TOOL.to_string(),
        duration_ms,
        error_kind,
        sub_results,
    }
}

#[async_trait]
impl Orchestrator for DualModeOrchestrator {
    async fn execute(&self, owner_id: &str, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let mut trace = RequestTrace::new();
        let mode = request.mode;
        let tool_label = match mode {
            ExecutionMode::Single => request.tool_hint.unwrap_or(self.config.default_tool).as_str(),
            ExecutionMode::Dual => DUAL_MODE_TOOL,
        };
        trace.advance(RequestPhase::ModeResolved);
        tracing::info!(
            request_id = %trace.request_id,
            owner = %owner_id,
            mode = ?mode,
            tool_hint = ?request.tool_hint,
            task_len = request.task_description.len(),
            "Execution request received"
        );

        let timeout = self.request_timeout();
        let scope = SandboxScope::new(self.supervisor.clone());
        let outcome = tokio::time::timeout(timeout, async {
            match mode {
                ExecutionMode::Single => self.run_single(owner_id, request, &mut trace, &scope).await,
                ExecutionMode::Dual => self.run_dual(owner_id, request, &mut trace, &scope, started).await,
            }
        })
        .await;
        scope.close().await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(request_id = %trace.request_id, timeout_secs = timeout.as_secs(), "Execution request timed out");
                ExecutionResult::failure(
                    tool_label,
                    ErrorKind::Timeout,
                    format!("request exceeded {:?}", timeout),
                    started.elapsed().as_millis() as u64,
                )
            }
        };

        trace.advance(if result.success {
            RequestPhase::Completed
        } else {
            RequestPhase::Failed
        });
        tracing::info!(
            request_id = %trace.request_id,
            tool_used = %result.tool_used,
            success = result.success,
            error_kind = ?result.error_kind,
            duration_ms = result.duration_ms,
            "Execution request finished"
        );
        metrics::counter!(
            "nb_executions_total",
            "tool" => result.tool_used.clone(),
            "success" => result.success.to_string()
        )
        .increment(1);
        metrics::histogram!("nb_execution_duration_ms", "tool" => result.tool_used.clone())
            .record(result.duration_ms as f64);
        self.events
            .emit(EventEnvelope::execution_completed(owner_id, &result))
            .await;
        result
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{MockCoordinationClient, TaskPlan};
    use neural_bridge_core::config::{AdapterConfig, EngineConfig, SupervisorConfig};
    use neural_bridge_core::mocks::RecordingEventEmitter;
    use neural_bridge_core::{CodeGenMode, EventType};
    use neural_bridge_core::config::DegradedPolicy;
    use neural_bridge_sandbox::{
        ExecResult, HealthMonitor, MockEngine, PortAllocator, SandboxEngine, TickReport,
    };

    struct Harness {
        engine: Arc<MockEngine>,
        supervisor: Arc<Supervisor>,
        coordinator: Arc<MockCoordinationClient>,
        events: Arc<RecordingEventEmitter>,
        orchestrator: DualModeOrchestrator,
    }

    fn harness_with(config: OrchestratorConfig) -> Harness {
        let engine = Arc::new(MockEngine::new());
        let supervisor = Arc::new(Supervisor::new(
            engine.clone(),
            Arc::new(PortAllocator::new(50000, 50003).unwrap()),
            SupervisorConfig::default(),
            EngineConfig::default(),
        ));
        let dyn_engine: Arc<dyn SandboxEngine> = engine.clone();
        let adapters = Arc::new(AdapterSet::new(dyn_engine, &AdapterConfig::default()));
        let coordinator = Arc::new(MockCoordinationClient::new());
        let events = Arc::new(RecordingEventEmitter::new());
        let orchestrator = DualModeOrchestrator::new(
            supervisor.clone(),
            adapters,
            coordinator.clone(),
            config,
            2000,
        )
        .with_event_emitter(events.clone());
        Harness {
            engine,
            supervisor,
            coordinator,
            events,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(OrchestratorConfig::default())
    }

    async fn assert_no_leaks(h: &Harness) {
        assert_eq!(h.supervisor.active_count(), 0);
        assert_eq!(h.supervisor.ports().available().await, 4);
        assert_eq!(h.engine.running_units(), 0);
    }

    #[tokio::test]
    async fn test_single_mode_uses_hint_and_stops_sandbox() {
        let h = harness();
        let request = ExecutionRequest::single("fizzbuzz", ToolKind::MultiAgentFlow);

        let result = h.orchestrator.execute("sess-1", request).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.tool_used, "claude-flow");
        assert!(result.sub_results.is_empty());
        assert_eq!(h.engine.launch_count(), 1);
        assert_eq!(h.events.count(EventType::ExecutionCompleted), 1);
        assert_no_leaks(&h).await;
    }

    #[tokio::test]
    async fn test_single_mode_default_tool_gets_configured_submode() {
        let h = harness();
        let request = ExecutionRequest {
            tool_hint: None,
            ..ExecutionRequest::single("write a test", ToolKind::CodeGen)
        };

        let result = h.orchestrator.execute("sess-1", request).await;
        assert!(result.success);
        assert_eq!(result.tool_used, "openai-codex");
        let invocation = &h.engine.invocations()[0];
        assert_eq!(invocation.args[..2], ["--approval-mode", "suggest"]);
    }

    #[tokio::test]
    async fn test_single_mode_keeps_explicit_submode() {
        let h = harness();
        let request = ExecutionRequest::single("refactor", ToolKind::CodeGen)
            .with_codegen_mode(CodeGenMode::AutoEdit);

        h.orchestrator.execute("sess-1", request).await;
        assert_eq!(h.engine.invocations()[0].args[1], "auto-edit");
    }

    #[tokio::test]
    async fn test_provisioning_failure_surfaces_kind() {
        let h = harness();
        h.engine.fail_next_launches(1);

        let result = h
            .orchestrator
            .execute("sess-1", ExecutionRequest::single("x", ToolKind::CodeGen))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ProcessSpawnFailed));
        assert_no_leaks(&h).await;
    }

    #[tokio::test]
    async fn test_dual_mode_fans_out_and_aggregates() {
        let h = harness();
        h.coordinator.push_plan(TaskPlan::new([
            (ToolKind::MultiAgentFlow, "design the API".to_string()),
            (ToolKind::CodeGen, "implement handlers".to_string()),
        ]));

        let result = h
            .orchestrator
            .execute("sess-1", ExecutionRequest::dual("build a todo service"))
            .await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.tool_used, DUAL_MODE_TOOL);
        assert!(result.output.contains("=== [claude-flow] ==="));
        assert!(result.output.contains("=== [openai-codex] ==="));
        assert_eq!(result.sub_results.len(), 2);
        assert_eq!(h.engine.launch_count(), 2);
        assert_no_leaks(&h).await;
    }

    #[tokio::test]
    async fn test_dual_mode_partial_failure_is_failure() {
        let h = harness();
        h.coordinator.push_plan(TaskPlan::new([
            (ToolKind::MultiAgentFlow, "design".to_string()),
            (ToolKind::CodeGen, "implement".to_string()),
        ]));
        h.engine.fail_next_execs(1);

        let result = h
            .orchestrator
            .execute("sess-1", ExecutionRequest::dual("build it"))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ProcessSpawnFailed));
        assert_eq!(result.sub_results.iter().filter(|s| s.success).count(), 1);
        assert_no_leaks(&h).await;
    }

    #[tokio::test]
    async fn test_dual_mode_single_assignment() {
        let h = harness();
        h.coordinator
            .push_plan(TaskPlan::new([(ToolKind::CodeGen, "just code it".to_string())]));
        h.engine.push_exec_result(ExecResult::ok(r#"{"result": "done"}"#));

        let result = h
            .orchestrator
            .execute("sess-1", ExecutionRequest::dual("small change"))
            .await;
        assert!(result.success);
        assert_eq!(result.output, "=== [openai-codex] ===\ndone");
        assert_eq!(h.engine.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_coordination_failure_creates_no_sandbox() {
        let h = harness();
        h.coordinator.push_failure("endpoint returned HTTP 503");

        let result = h
            .orchestrator
            .execute("sess-1", ExecutionRequest::dual("anything"))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::CoordinationUnavailable));
        assert_eq!(result.tool_used, DUAL_MODE_TOOL);
        assert_eq!(h.engine.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_plan_creates_no_sandbox() {
        let h = harness();
        h.coordinator.push_plan(TaskPlan::new([
            (ToolKind::CodeGen, "a".to_string()),
            (ToolKind::CodeGen, "b".to_string()),
        ]));

        let result = h
            .orchestrator
            .execute("sess-1", ExecutionRequest::dual("anything"))
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::CoordinationUnavailable));
        assert_eq!(h.engine.launch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_stops_inflight_sandboxes() {
        let h = harness_with(OrchestratorConfig {
            request_timeout_secs: 5,
            ..OrchestratorConfig::default()
        });
        h.engine.set_exec_delay(Duration::from_secs(3600));

        let result = h
            .orchestrator
            .execute("sess-1", ExecutionRequest::single("slow", ToolKind::CodeGen))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(h.engine.launch_count(), 1);
        assert_no_leaks(&h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dual_timeout_stops_both_sandboxes() {
        let h = harness_with(OrchestratorConfig {
            request_timeout_secs: 5,
            ..OrchestratorConfig::default()
        });
        h.coordinator.push_plan(TaskPlan::new([
            (ToolKind::MultiAgentFlow, "design".to_string()),
            (ToolKind::CodeGen, "implement".to_string()),
        ]));
        h.engine.set_exec_delay(Duration::from_secs(3600));

        let result = h
            .orchestrator
            .execute("sess-1", ExecutionRequest::dual("slow"))
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.tool_used, DUAL_MODE_TOOL);
        assert_eq!(h.engine.launch_count(), 2);
        assert_no_leaks(&h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_during_startup_teardown_leaves_nothing_behind() {
        // Startup gives up at 30s and the stop grace runs to 40s, so the
        // request deadline lands in the middle of the teardown.
        let h = harness_with(OrchestratorConfig {
            request_timeout_secs: 31,
            ..OrchestratorConfig::default()
        });
        h.engine.set_healthy(false);
        h.engine.ignore_sigterm(true);

        let result = h
            .orchestrator
            .execute("sess-1", ExecutionRequest::single("x", ToolKind::MultiAgentFlow))
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));

        tokio::time::sleep(Duration::from_secs(120)).await;
        h.supervisor.cleanup_orphaned().await;
        assert_no_leaks(&h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_sandbox_in_use_is_stopped_not_replaced() {
        let h = harness();
        h.engine.set_exec_delay(Duration::from_secs(10));
        let monitor = HealthMonitor::new(h.supervisor.clone()).with_policy(DegradedPolicy::Restart);

        let request = h
            .orchestrator
            .execute("sess-1", ExecutionRequest::single("slow", ToolKind::CodeGen));
        let ticks = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let live = h.supervisor.list().await;
            assert_eq!(live.len(), 1);
            assert!(h.supervisor.is_held(&live[0].id));
            h.engine.script_probes([false, false, false]);
            let mut total = TickReport::default();
            for n in 1..=3 {
                let report = monitor.tick(n).await;
                total.stopped += report.stopped;
                total.restarted += report.restarted;
            }
            total
        };
        let (_, total) = tokio::join!(request, ticks);

        assert_eq!(total.stopped, 1);
        assert_eq!(total.restarted, 0);
        assert_eq!(h.engine.launch_count(), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_no_leaks(&h).await;
    }

    #[test]
    fn test_aggregate_takes_first_failure_kind() {
        let results = vec![
            (ToolKind::MultiAgentFlow, ExecutionResult::success("claude-flow", "ok", 10)),
            (
                ToolKind::CodeGen,
                ExecutionResult::failure("openai-codex", ErrorKind::Timeout, "slow", 20),
            ),
        ];
        let merged = aggregate(results, 25);
        assert!(!merged.success);
        assert_eq!(merged.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(merged.duration_ms, 25);
        assert!(merged.sub_results[0].success);
        assert!(!merged.sub_results[1].success);
    }
}
