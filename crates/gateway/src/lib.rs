#![deny(unused)]
//! HTTP entry point for Neural Bridge.
//!
//! Commands arrive as JSON envelopes on `POST /v1/command`, pass the security
//! gate and are dispatched to the orchestrator or the sandbox supervisor.
//! Sessions are issued on `POST /v1/sessions` against the bootstrap token.

pub mod dispatcher;
pub mod expiry;
pub mod server;

pub use dispatcher::{Command, CommandDispatcher};
pub use expiry::StopSandboxesOnExpiry;
pub use server::{status_for, AppState, GatewayServer};
