//! Scriptable in-memory engine for testing without Docker.
//!
//! Every lifecycle transition the supervisor handles can be forced from a
//! test: failed launches, unhealthy probes, processes ignoring SIGTERM,
//! units dying underneath the supervisor, and hung executions.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use neural_bridge_core::config::ProbeKind;
use neural_bridge_core::{Error, Result, SandboxId};

use crate::engine::{ExecResult, Invocation, LaunchSpec, ManagedUnit, SandboxEngine};

#[derive(Debug, Clone)]
struct MockUnit {
    sandbox_id: SandboxId,
    port: u16,
    running: bool,
}

/// In-memory engine with scripted behavior and call counters.
pub struct MockEngine {
    units: DashMap<String, MockUnit>,
    next_handle: AtomicUsize,
    launch_failures: AtomicUsize,
    probe_script: Mutex<VecDeque<bool>>,
    default_healthy: AtomicBool,
    ignore_sigterm: AtomicBool,
    exec_responses: Mutex<VecDeque<ExecResult>>,
    exec_failures: AtomicUsize,
    exec_delay: Mutex<Option<Duration>>,
    invocations: Mutex<Vec<Invocation>>,
    launches: AtomicUsize,
    kills: AtomicUsize,
    reaps: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            units: DashMap::new(),
            next_handle: AtomicUsize::new(1),
            launch_failures: AtomicUsize::new(0),
            probe_script: Mutex::new(VecDeque::new()),
            default_healthy: AtomicBool::new(true),
            ignore_sigterm: AtomicBool::new(false),
            exec_responses: Mutex::new(VecDeque::new()),
            exec_failures: AtomicUsize::new(0),
            exec_delay: Mutex::new(None),
            invocations: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            reaps: AtomicUsize::new(0),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock whose exec calls return `responses` in order.
    pub fn with_exec_responses(responses: Vec<ExecResult>) -> Self {
        let engine = Self::default();
        *engine.exec_responses.lock().unwrap_or_else(|e| e.into_inner()) = responses.into();
        engine
    }

    // ---- scripting ------------------------------------------------------

    /// Fail the next `n` launches with a spawn error.
    pub fn fail_next_launches(&self, n: usize) {
        self.launch_failures.store(n, Ordering::SeqCst);
    }

    /// Outcome of probes once the script is exhausted.
    pub fn set_healthy(&self, healthy: bool) {
        self.default_healthy.store(healthy, Ordering::SeqCst);
    }

    /// Queue probe outcomes consumed before the default applies.
    pub fn script_probes(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.probe_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(outcomes);
    }

    /// Units keep running after SIGTERM; only `kill` stops them.
    pub fn ignore_sigterm(&self, ignore: bool) {
        self.ignore_sigterm.store(ignore, Ordering::SeqCst);
    }

    pub fn push_exec_result(&self, result: ExecResult) {
        self.exec_responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    /// Fail the next `n` exec calls as if the program could not be started.
    pub fn fail_next_execs(&self, n: usize) {
        self.exec_failures.store(n, Ordering::SeqCst);
    }

    /// Every exec call sleeps this long before answering.
    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// Simulate the unit dying outside the supervisor's control.
    pub fn crash(&self, handle: &str) {
        if let Some(mut unit) = self.units.get_mut(handle) {
            unit.running = false;
        }
    }

    /// Add a labelled unit the supervisor never launched (left over from a previous run).
    pub fn inject_foreign_unit(&self, sandbox_id: SandboxId, port: u16) -> String {
        let handle = self.allocate_handle();
        self.units.insert(
            handle.clone(),
            MockUnit {
                sandbox_id,
                port,
                running: true,
            },
        );
        handle
    }

    // ---- observation ----------------------------------------------------

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn reap_count(&self) -> usize {
        self.reaps.load(Ordering::SeqCst)
    }

    /// Units that exist and are running.
    pub fn running_units(&self) -> usize {
        self.units.iter().filter(|u| u.running).count()
    }

    /// Every invocation passed to `exec`, in call order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn allocate_handle(&self) -> String {
        format!("mock-{}", self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SandboxEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        if Self::take_one(&self.launch_failures) {
            return Err(Error::spawn_failed(format!(
                "[mock] launch of {} failed",
                spec.tool_kind
            )));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        let handle = self.allocate_handle();
        self.units.insert(
            handle.clone(),
            MockUnit {
                sandbox_id: spec.sandbox_id.clone(),
                port: spec.port,
                running: true,
            },
        );
        Ok(handle)
    }

    async fn probe(
        &self,
        handle: &str,
        _port: u16,
        _kind: ProbeKind,
        _timeout: Duration,
    ) -> Result<()> {
        if !self.is_running(handle).await? {
            return Err(Error::HealthCheckFailed(format!(
                "[mock] {} is not running",
                handle
            )));
        }
        let scripted = self
            .probe_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let healthy = scripted.unwrap_or_else(|| self.default_healthy.load(Ordering::SeqCst));
        if healthy {
            Ok(())
        } else {
            Err(Error::HealthCheckFailed(format!(
                "[mock] probe of {} failed",
                handle
            )))
        }
    }

    async fn exec(&self, handle: &str, invocation: &Invocation, timeout: Duration) -> Result<ExecResult> {
        if !self.units.contains_key(handle) {
            return Err(Error::SandboxNotFound(handle.to_string()));
        }
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation.clone());

        if Self::take_one(&self.exec_failures) {
            return Err(Error::spawn_failed(format!(
                "[mock] '{}' could not be started",
                invocation.program
            )));
        }

        let delay = *self.exec_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            if tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .is_err()
            {
                return Ok(ExecResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("[Execution timed out after {:?}]", timeout),
                    timed_out: true,
                });
            }
        }

        let scripted = self
            .exec_responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(scripted.unwrap_or_else(|| ExecResult::ok("[mock] command executed")))
    }

    async fn signal_stop(&self, handle: &str) -> Result<()> {
        if !self.ignore_sigterm.load(Ordering::SeqCst) {
            if let Some(mut unit) = self.units.get_mut(handle) {
                unit.running = false;
            }
        }
        Ok(())
    }

    async fn kill(&self, handle: &str) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if let Some(mut unit) = self.units.get_mut(handle) {
            unit.running = false;
        }
        Ok(())
    }

    async fn is_running(&self, handle: &str) -> Result<bool> {
        Ok(self.units.get(handle).map(|u| u.running).unwrap_or(false))
    }

    async fn reap(&self, handle: &str) -> Result<()> {
        if self.units.remove(handle).is_some() {
            self.reaps.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedUnit>> {
        Ok(self
            .units
            .iter()
            .map(|u| ManagedUnit {
                handle: u.key().clone(),
                sandbox_id: Some(u.sandbox_id.clone()),
                port: Some(u.port),
                running: u.running,
            })
            .collect())
    }
}
