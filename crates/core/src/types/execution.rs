//! Execution request and result shapes.

use serde::{Deserialize, Serialize};

use super::tool::{CodeGenMode, ToolKind};
use crate::error::{Error, ErrorKind};

/// `tool_used` value for aggregated dual-mode results.
pub const DUAL_MODE_TOOL: &str = "dual-mode-orchestration";

/// Whether a task runs on one backend or is planned across several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    #[serde(alias = "Single")]
    Single,
    #[serde(alias = "Dual")]
    Dual,
}

/// A task submitted for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_description: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub tool_hint: Option<ToolKind>,
    /// Required by the code generation backend. Filled from configuration
    /// by the orchestrator when absent.
    #[serde(default)]
    pub codegen_mode: Option<CodeGenMode>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl ExecutionRequest {
    pub fn single(task: impl Into<String>, tool: ToolKind) -> Self {
        Self {
            task_description: task.into(),
            mode: ExecutionMode::Single,
            tool_hint: Some(tool),
            codegen_mode: None,
            extra_args: Vec::new(),
        }
    }

    pub fn dual(task: impl Into<String>) -> Self {
        Self {
            task_description: task.into(),
            mode: ExecutionMode::Dual,
            tool_hint: None,
            codegen_mode: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_codegen_mode(mut self, mode: CodeGenMode) -> Self {
        self.codegen_mode = Some(mode);
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

/// Per-backend outcome inside an aggregated dual-mode result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubResult {
    pub tool: ToolKind,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Normalized outcome of an execution. Immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub tool_used: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_results: Vec<SubResult>,
}

impl ExecutionResult {
    pub fn success(tool_used: impl Into<String>, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            output: output.into(),
            tool_used: tool_used.into(),
            duration_ms,
            error_kind: None,
            sub_results: Vec::new(),
        }
    }

    pub fn failure(
        tool_used: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            output: message.into(),
            tool_used: tool_used.into(),
            duration_ms,
            error_kind: Some(kind),
            sub_results: Vec::new(),
        }
    }

    pub fn from_error(tool_used: impl Into<String>, error: &Error, duration_ms: u64) -> Self {
        Self::failure(tool_used, error.kind(), error.to_string(), duration_ms)
    }
}
