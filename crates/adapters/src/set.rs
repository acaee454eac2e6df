//! One adapter per tool kind.

use std::sync::Arc;

use neural_bridge_core::config::AdapterConfig;
use neural_bridge_core::ToolKind;
use neural_bridge_sandbox::SandboxEngine;

use crate::adapter::ToolAdapter;
use crate::codegen::CodeGenAdapter;
use crate::flow::MultiAgentFlowAdapter;

/// Resolves a [`ToolKind`] to its adapter. Adding a kind without an
/// adapter fails to compile.
pub struct AdapterSet {
    flow: MultiAgentFlowAdapter,
    codegen: CodeGenAdapter,
}

impl AdapterSet {
    pub fn new(engine: Arc<dyn SandboxEngine>, config: &AdapterConfig) -> Self {
        Self {
            flow: MultiAgentFlowAdapter::new(engine.clone(), config),
            codegen: CodeGenAdapter::new(engine, config),
        }
    }

    pub fn get(&self, kind: ToolKind) -> &dyn ToolAdapter {
        match kind {
            ToolKind::MultiAgentFlow => &self.flow,
            ToolKind::CodeGen => &self.codegen,
        }
    }
}
