#![deny(unused)]
//! Governance for Neural Bridge.
//!
//! This crate provides:
//! - Session issuance, expiry and pruning
//! - Sliding-window rate limiting per session and command class
//! - The IPC security gate (size, content, session, permission, rate)
//! - Audit logging of every gate decision
//! - Logging, distributed tracing and Prometheus metrics setup

pub mod audit;
pub mod emitter;
pub mod gate;
pub mod metrics;
pub mod rate_limit;
pub mod sessions;
pub mod tracing_layer;

pub use audit::{AuditEntry, AuditFilter, AuditOutcome, AuditStore, InMemoryAuditStore};
pub use emitter::TracingEventEmitter;
pub use gate::SecurityGate;
pub use metrics::{setup_metrics_recorder, track_command, track_request, track_security_decision};
pub use rate_limit::{RateDecision, RateLimitPolicy, SlidingWindow};
pub use sessions::{IssuedSession, Session, SessionExpiryHook, SessionManager, SessionStats};
pub use tracing_layer::configure_tracing;
