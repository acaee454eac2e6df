//! Core traits for Neural Bridge.
//!
//! - `events`: structured event sink (EventEmitter)
//! - `orchestrator`: execution entry point consumed by the command dispatcher

pub mod events;
pub mod orchestrator;

pub use events::*;
pub use orchestrator::*;
