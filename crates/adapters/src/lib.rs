#![deny(unused)]
//! Tool adapters for Neural Bridge.
//!
//! Each adapter turns a generic `ExecutionRequest` into the native invocation
//! of one backend, runs it inside an already-provisioned sandbox, and
//! normalizes the outcome into an `ExecutionResult`.

pub mod adapter;
pub mod codegen;
pub mod flow;
pub mod set;

pub use adapter::ToolAdapter;
pub use codegen::CodeGenAdapter;
pub use flow::MultiAgentFlowAdapter;
pub use set::AdapterSet;
