use config::{Config, ConfigError, Environment, File, FileFormat};
use secrecy::Secret;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::types::{CodeGenMode, ToolKind};

/// Start-up configuration for the whole engine.
///
/// Security-relevant sections carry no serde defaults: a missing value fails
/// `load()` instead of silently becoming permissive.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub ports: PortPoolConfig,
    pub supervisor: SupervisorConfig,
    pub engine: EngineConfig,
    pub security: SecurityConfig,
    pub orchestrator: OrchestratorConfig,
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub adapters: AdapterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Required on `POST /v1/sessions`. Session issuance is disabled when unset.
    #[serde(default)]
    pub bootstrap_token: Option<Secret<String>>,
    /// Browser origins allowed to call the API. No CORS layer when empty.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Contiguous port range handed out to sandboxes.
#[derive(Debug, Deserialize, Clone)]
pub struct PortPoolConfig {
    pub start: u16,
    pub size: u16,
}

impl PortPoolConfig {
    /// Last port in the pool, or `None` when the range overflows.
    pub fn end(&self) -> Option<u16> {
        self.size
            .checked_sub(1)
            .and_then(|span| self.start.checked_add(span))
    }
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            start: 50000,
            size: 100,
        }
    }
}

/// What the health monitor does with a degraded sandbox.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DegradedPolicy {
    Stop,
    Restart,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    pub startup_timeout_secs: u64,
    pub health_poll_interval_ms: u64,
    pub health_failure_threshold: u32,
    pub probe_timeout_ms: u64,
    pub stop_grace_secs: u64,
    pub monitor_interval_secs: u64,
    /// Orphan sweep runs every N monitor ticks.
    pub orphan_sweep_every: u32,
    pub degraded_policy: DegradedPolicy,
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: 30,
            health_poll_interval_ms: 500,
            health_failure_threshold: 3,
            probe_timeout_ms: 2000,
            stop_grace_secs: 10,
            monitor_interval_secs: 15,
            orphan_sweep_every: 4,
            degraded_policy: DegradedPolicy::Stop,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    Docker,
    Process,
}

/// How a sandbox is judged healthy.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// The backend accepts TCP connections on its assigned port.
    #[default]
    Tcp,
    /// The backing process/container is alive.
    Running,
}

/// Launch recipe for one tool's sandbox.
///
/// `{port}` in `command` is replaced with the assigned port.
#[derive(Debug, Deserialize, Clone)]
pub struct ToolProfile {
    /// Container image (docker backend only).
    #[serde(default)]
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub probe: ProbeKind,
    #[serde(default)]
    pub workdir: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerLimits {
    pub memory_limit_mb: i64,
    pub cpu_quota: i64,
    pub network_mode: String,
}

impl Default for DockerLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: 2048,
            cpu_quota: 100_000,
            network_mode: "bridge".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub backend: EngineBackend,
    #[serde(default)]
    pub docker: DockerLimits,
    pub multi_agent_flow: ToolProfile,
    pub code_gen: ToolProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::Docker,
            docker: DockerLimits::default(),
            multi_agent_flow: ToolProfile {
                image: "neural-bridge/claude-flow:latest".into(),
                command: vec![
                    "npx".into(),
                    "claude-flow@alpha".into(),
                    "start".into(),
                    "--port".into(),
                    "{port}".into(),
                ],
                env: HashMap::new(),
                probe: ProbeKind::Tcp,
                workdir: Some("/workspace".into()),
            },
            code_gen: ToolProfile {
                image: "neural-bridge/openai-codex:latest".into(),
                command: vec!["sleep".into(), "infinity".into()],
                env: HashMap::new(),
                probe: ProbeKind::Running,
                workdir: Some("/workspace".into()),
            },
        }
    }
}

impl EngineConfig {
    pub fn profile(&self, kind: ToolKind) -> &ToolProfile {
        match kind {
            ToolKind::MultiAgentFlow => &self.multi_agent_flow,
            ToolKind::CodeGen => &self.code_gen,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub default: RateLimitRule,
    /// Per-command overrides; each forms its own command class.
    #[serde(default)]
    pub commands: HashMap<String, RateLimitRule>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub max_payload_bytes: usize,
    pub blocked_patterns: Vec<String>,
    pub session_ttl_secs: u64,
    pub idle_timeout_secs: u64,
    pub prune_interval_secs: u64,
    pub rate_limit: RateLimitConfig,
    /// Permissions granted when a session is issued without an explicit set.
    pub default_permissions: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            blocked_patterns: vec![
                r"<script[\s\S]*?>".into(),
                r"javascript:".into(),
                r"data:text/html".into(),
                r"vbscript:".into(),
                r"on(load|error|click|mouseover)\s*=".into(),
                r"eval\s*\(".into(),
            ],
            session_ttl_secs: 24 * 60 * 60,
            idle_timeout_secs: 30 * 60,
            prune_interval_secs: 300,
            rate_limit: RateLimitConfig {
                default: RateLimitRule {
                    max_requests: 100,
                    window_secs: 60,
                },
                commands: HashMap::new(),
            },
            default_permissions: vec!["execute".into(), "list_sandboxes".into(), "logout".into()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    pub default_tool: ToolKind,
    pub request_timeout_secs: u64,
    /// Used when a code-gen request does not name a sub-mode. Never `full-auto`.
    pub default_codegen_mode: CodeGenMode,
}

impl OrchestratorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_tool: ToolKind::CodeGen,
            request_timeout_secs: 900,
            default_codegen_mode: CodeGenMode::Suggest,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinationConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<Secret<String>>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_subtask_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdapterConfig {
    #[serde(default)]
    pub openai_api_key: Option<Secret<String>>,
    #[serde(default)]
    pub anthropic_api_key: Option<Secret<String>>,
    #[serde(default = "default_sparc_mode")]
    pub flow_sparc_mode: String,
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
}

fn default_sparc_mode() -> String {
    "coder".into()
}

fn default_exec_timeout() -> u64 {
    600
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            anthropic_api_key: None,
            flow_sparc_mode: default_sparc_mode(),
            exec_timeout_secs: default_exec_timeout(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("NB_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map NB__SECURITY__MAX_PAYLOAD_BYTES=2048 to security.max_payload_bytes
            .add_source(Environment::with_prefix("NB").separator("__"))
            .build()?;

        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a safety property.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Message(msg));

        if self.ports.start == 0 || self.ports.size == 0 || self.ports.end().is_none() {
            return fail(format!(
                "ports: invalid range start={} size={}",
                self.ports.start, self.ports.size
            ));
        }

        let sup = &self.supervisor;
        if sup.startup_timeout_secs == 0 {
            return fail("supervisor.startup_timeout_secs must be > 0".into());
        }
        if sup.health_failure_threshold == 0 || sup.health_poll_interval_ms == 0 {
            return fail("supervisor: health threshold and poll interval must be > 0".into());
        }
        if sup.monitor_interval_secs == 0 {
            return fail("supervisor.monitor_interval_secs must be > 0".into());
        }

        let sec = &self.security;
        if sec.max_payload_bytes == 0 {
            return fail("security.max_payload_bytes must be > 0".into());
        }
        if sec.session_ttl_secs == 0 || sec.idle_timeout_secs == 0 {
            return fail("security: session ttl and idle timeout must be > 0".into());
        }
        if sec.prune_interval_secs == 0 {
            return fail("security.prune_interval_secs must be > 0".into());
        }
        let rules = std::iter::once(("default", &sec.rate_limit.default)).chain(
            sec.rate_limit
                .commands
                .iter()
                .map(|(name, rule)| (name.as_str(), rule)),
        );
        for (class, rule) in rules {
            if rule.max_requests == 0 || rule.window_secs == 0 {
                return fail(format!(
                    "security.rate_limit.{}: max_requests and window_secs must be > 0",
                    class
                ));
            }
        }

        if self.orchestrator.request_timeout_secs == 0 {
            return fail("orchestrator.request_timeout_secs must be > 0".into());
        }
        if self.orchestrator.default_codegen_mode == CodeGenMode::FullAuto {
            return fail(
                "orchestrator.default_codegen_mode may not be full-auto; request it explicitly"
                    .into(),
            );
        }

        match url::Url::parse(&self.coordination.endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return fail(format!(
                    "coordination.endpoint is not an http(s) URL: {}",
                    self.coordination.endpoint
                ))
            }
        }
        if self.coordination.max_subtask_chars == 0 || self.coordination.timeout_secs == 0 {
            return fail("coordination: max_subtask_chars and timeout_secs must be > 0".into());
        }

        Ok(())
    }

    /// Credential keys left unset. The process still starts; callers warn.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.coordination.api_key.is_none() {
            missing.push("coordination.api_key");
        }
        if self.adapters.openai_api_key.is_none() {
            missing.push("adapters.openai_api_key");
        }
        if self.adapters.anthropic_api_key.is_none() {
            missing.push("adapters.anthropic_api_key");
        }
        missing
    }
}
