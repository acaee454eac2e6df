//! Coordination client for dual-mode planning.
//!
//! The coordination model splits one task into per-backend subtasks. Its
//! answer is untrusted input: [`validate_plan`] bounds it before any sandbox
//! is created.

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use neural_bridge_core::config::CoordinationConfig;
use neural_bridge_core::{Error, Result, ToolKind};

const PLANNER_PROMPT: &str = "You split software tasks between two tools. \
\"claude-flow\" runs multi-agent workflows (architecture, research, multi-file features). \
\"openai-codex\" writes and edits code directly. \
Answer with a JSON object of the form \
{\"subtasks\": [{\"tool\": \"claude-flow\" | \"openai-codex\", \"task\": \"...\"}]} \
using one or two subtasks and at most one per tool.";

// =============================================================================
// Plan Types
// =============================================================================

/// Plan as returned by the coordination model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub subtasks: Vec<PlanItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub tool: String,
    pub task: String,
}

impl TaskPlan {
    pub fn new(items: impl IntoIterator<Item = (ToolKind, String)>) -> Self {
        Self {
            subtasks: items
                .into_iter()
                .map(|(tool, task)| PlanItem {
                    tool: tool.as_str().to_string(),
                    task,
                })
                .collect(),
        }
    }
}

/// A validated subtask bound to a known backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub tool: ToolKind,
    pub task: String,
}

/// Accept a plan only if it names one or two distinct known tools, each
/// with non-empty task text of at most `max_chars` characters.
pub fn validate_plan(plan: TaskPlan, max_chars: usize) -> Result<Vec<Assignment>> {
    let invalid = |why: String| Error::coordination(format!("invalid plan: {}", why));

    if plan.subtasks.is_empty() || plan.subtasks.len() > ToolKind::ALL.len() {
        return Err(invalid(format!("{} subtasks", plan.subtasks.len())));
    }

    let mut seen = HashSet::new();
    let mut assignments = Vec::with_capacity(plan.subtasks.len());
    for item in plan.subtasks {
        let tool: ToolKind = item
            .tool
            .parse()
            .map_err(|_| invalid(format!("unknown tool '{}'", item.tool)))?;
        if !seen.insert(tool) {
            return Err(invalid(format!("{} assigned twice", tool)));
        }
        let task = item.task.trim();
        if task.is_empty() {
            return Err(invalid(format!("empty task for {}", tool)));
        }
        if task.chars().count() > max_chars {
            return Err(invalid(format!("task for {} exceeds {} chars", tool, max_chars)));
        }
        assignments.push(Assignment {
            tool,
            task: task.to_string(),
        });
    }
    Ok(assignments)
}

// =============================================================================
// Client Trait
// =============================================================================

/// Obtains a task split from the external coordination model.
///
/// Every failure is reported as `CoordinationUnavailable`.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn plan(&self, task: &str) -> Result<TaskPlan>;
}

// =============================================================================
// HTTP Client
// =============================================================================

/// OpenAI-compatible chat completions client (OpenRouter by default).
pub struct HttpCoordinationClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<Secret<String>>,
    model: String,
}

impl HttpCoordinationClient {
    pub fn new(config: &CoordinationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("coordination client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

/// Accepts either `{"subtasks": [...]}` or a chat completion whose first
/// message content is that object.
fn parse_plan(body: &Value) -> Result<TaskPlan> {
    if body.get("subtasks").is_some() {
        return serde_json::from_value(body.clone())
            .map_err(|e| Error::coordination(format!("malformed plan: {}", e)));
    }
    let content = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::coordination("response carries no plan"))?;
    serde_json::from_str(content).map_err(|e| Error::coordination(format!("malformed plan: {}", e)))
}

#[async_trait]
impl CoordinationClient for HttpCoordinationClient {
    async fn plan(&self, task: &str) -> Result<TaskPlan> {
        let body = json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": PLANNER_PROMPT },
                { "role": "user", "content": task },
            ],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(endpoint = %self.endpoint, error = %e, "Coordination request failed");
            Error::coordination(format!("request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(endpoint = %self.endpoint, status = %status, "Coordination endpoint returned an error");
            return Err(Error::coordination(format!("endpoint returned HTTP {}", status.as_u16())));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::coordination(format!("unreadable response: {}", e)))?;
        let plan = parse_plan(&value)?;
        tracing::debug!(subtasks = plan.subtasks.len(), "Coordination plan received");
        Ok(plan)
    }
}

// =============================================================================
// Mock Client
// =============================================================================

/// Scripted coordination client. Replies are consumed in order; once the
/// script is empty every call fails.
#[derive(Default)]
pub struct MockCoordinationClient {
    replies: Mutex<VecDeque<std::result::Result<TaskPlan, String>>>,
    calls: AtomicUsize,
}

impl MockCoordinationClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(plan: TaskPlan) -> Self {
        let client = Self::default();
        client.push_plan(plan);
        client
    }

    pub fn failing(message: impl Into<String>) -> Self {
        let client = Self::default();
        client.push_failure(message);
        client
    }

    pub fn push_plan(&self, plan: TaskPlan) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(plan));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(message.into()));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationClient for MockCoordinationClient {
    async fn plan(&self, _task: &str) -> Result<TaskPlan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match reply {
            Some(Ok(plan)) => Ok(plan),
            Some(Err(message)) => Err(Error::coordination(message)),
            None => Err(Error::coordination("[mock] no scripted plan")),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
