//! Tool backends known to the bridge.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::Error;

/// The closed set of AI tool backends.
///
/// Adding a backend means adding a variant here; every dispatch site matches
/// exhaustively so the compiler finds the places that need an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolKind {
    #[serde(
        rename = "claude-flow",
        alias = "MultiAgentFlow",
        alias = "multi-agent-flow"
    )]
    MultiAgentFlow,
    #[serde(rename = "openai-codex", alias = "CodeGen", alias = "code-gen")]
    CodeGen,
}

impl ToolKind {
    pub const ALL: [ToolKind; 2] = [ToolKind::MultiAgentFlow, ToolKind::CodeGen];

    /// The backend name reported as `tool_used`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultiAgentFlow => "claude-flow",
            Self::CodeGen => "openai-codex",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude-flow" | "multiagentflow" | "multi-agent-flow" => Ok(Self::MultiAgentFlow),
            "openai-codex" | "codegen" | "code-gen" => Ok(Self::CodeGen),
            other => Err(Error::invalid_payload(format!("unknown tool '{}'", other))),
        }
    }
}

/// Autonomy level for the code generation backend, in escalating order of risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeGenMode {
    /// Proposes changes, applies nothing.
    #[serde(alias = "Suggest")]
    Suggest,
    /// Edits files, asks before running commands.
    #[serde(alias = "AutoEdit")]
    AutoEdit,
    /// Edits files and runs commands without confirmation.
    #[serde(alias = "FullAuto")]
    FullAuto,
}

impl CodeGenMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suggest => "suggest",
            Self::AutoEdit => "auto-edit",
            Self::FullAuto => "full-auto",
        }
    }
}

impl std::fmt::Display for CodeGenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
