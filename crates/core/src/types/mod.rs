//! Core type definitions for Neural Bridge.
//!
//! Broken down into submodules by concern.

pub mod envelope;
pub mod execution;
pub mod sandbox;
pub mod tool;

pub use envelope::*;
pub use execution::*;
pub use sandbox::*;
pub use tool::*;
