#![deny(unused)]
//! Request orchestration for Neural Bridge.
//!
//! The [`DualModeOrchestrator`] resolves each request to one backend or, in
//! dual mode, asks a coordination model to split the task, fans the pieces
//! out to their adapters and merges the results.

pub mod coordination;
pub mod orchestrator;

pub use coordination::{
    validate_plan, Assignment, CoordinationClient, HttpCoordinationClient,
    MockCoordinationClient, PlanItem, TaskPlan,
};
pub use orchestrator::{DualModeOrchestrator, RequestPhase};
