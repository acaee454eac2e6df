#![deny(unused)]
//! Sandbox supervision for Neural Bridge.
//!
//! This crate owns the lifecycle of the isolated units that run each AI tool
//! backend, and the port pool they bind to.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  Orchestrator / Command dispatcher     │
//! │    ↓ create / stop / health_check      │
//! ├────────────────────────────────────────┤
//! │  Supervisor  ──► PortAllocator         │
//! │    ↓ SandboxEngine trait               │
//! ├────────────────────────────────────────┤
//! │  DockerEngine │ ProcessEngine │ Mock   │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use neural_bridge_sandbox::{DockerEngine, PortAllocator, Supervisor};
//!
//! let engine = Arc::new(DockerEngine::new(config.engine.docker.clone())?);
//! let ports = Arc::new(PortAllocator::from_config(&config.ports)?);
//! let supervisor = Arc::new(Supervisor::new(engine, ports, config.supervisor.clone(), config.engine.clone()));
//!
//! let sandbox = supervisor.create_sandbox(ToolKind::CodeGen, &session_id).await?;
//! supervisor.stop_sandbox(&sandbox.id).await?;
//! ```

pub mod docker;
pub mod engine;
pub mod mock;
pub mod monitor;
pub mod ports;
pub mod process;
pub mod supervisor;

pub use docker::DockerEngine;
pub use engine::{ExecResult, Invocation, LaunchSpec, ManagedUnit, SandboxEngine};
pub use mock::MockEngine;
pub use monitor::{HealthMonitor, MonitorHandle, TickReport};
pub use ports::{PortAllocator, PortLease};
pub use process::ProcessEngine;
pub use supervisor::Supervisor;
