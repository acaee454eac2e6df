#![deny(unused)]
//! Core types, traits, and error definitions for Neural Bridge.
//!
//! This crate provides the building blocks shared by the sandbox supervisor,
//! the tool adapters, the orchestrator, and the security gate.

pub mod config;
pub mod error;
pub mod events;
pub mod mocks;
pub mod traits;
pub mod types;

pub use error::{Error, ErrorKind, Result, SecurityError};
pub use events::*;
pub use traits::*;
pub use types::*;
