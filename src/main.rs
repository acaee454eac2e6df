#![deny(unused)]
//! Neural Bridge - AI tool container orchestration engine.
//!
//! Runs AI coding tools in isolated sandboxes, routes tasks to one or both
//! backends, and guards the command channel with sessions, content filtering
//! and rate limits.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use neural_bridge_adapters::AdapterSet;
use neural_bridge_controller::{DualModeOrchestrator, HttpCoordinationClient};
use neural_bridge_core::config::{AppConfig, EngineBackend};
use neural_bridge_core::EventEmitter;
use neural_bridge_gateway::{CommandDispatcher, GatewayServer, StopSandboxesOnExpiry};
use neural_bridge_governance::{
    configure_tracing, setup_metrics_recorder, SecurityGate, SessionManager, TracingEventEmitter,
};
use neural_bridge_sandbox::{
    DockerEngine, HealthMonitor, PortAllocator, ProcessEngine, SandboxEngine, Supervisor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    configure_tracing(&config.logging)?;

    tracing::info!("Starting Neural Bridge v{}", env!("CARGO_PKG_VERSION"));
    for key in config.missing_credentials() {
        match key {
            "coordination.api_key" => tracing::warn!(
                key = key,
                endpoint = %config.coordination.endpoint,
                "No coordination credential configured; dual-mode requests will be sent unauthenticated and will likely fail"
            ),
            _ => tracing::warn!(key = key, "No credential configured; the tool must find one in its sandbox environment"),
        }
    }

    // =========================================================================
    // Observability
    // =========================================================================
    let metrics_handle = setup_metrics_recorder()?;
    let events: Arc<dyn EventEmitter> = Arc::new(TracingEventEmitter);

    // =========================================================================
    // Sandbox engine & supervisor
    // =========================================================================
    let engine: Arc<dyn SandboxEngine> = match config.engine.backend {
        EngineBackend::Docker => Arc::new(DockerEngine::new(config.engine.docker.clone())?),
        EngineBackend::Process => {
            tracing::warn!("Process backend selected; sandboxes are not container-isolated");
            Arc::new(ProcessEngine::new())
        }
    };
    if !engine.is_available().await {
        anyhow::bail!("Sandbox engine '{}' is not available", engine.name());
    }

    let ports = Arc::new(PortAllocator::from_config(&config.ports)?);
    let supervisor = Arc::new(
        Supervisor::new(
            engine.clone(),
            ports,
            config.supervisor.clone(),
            config.engine.clone(),
        )
        .with_event_emitter(events.clone()),
    );

    let reclaimed = supervisor.cleanup_orphaned().await;
    if !reclaimed.is_empty() {
        tracing::info!(count = reclaimed.len(), "Reclaimed sandboxes left by a previous run");
    }
    let monitor = HealthMonitor::new(supervisor.clone()).spawn();

    // =========================================================================
    // Orchestration
    // =========================================================================
    let adapters = Arc::new(AdapterSet::new(engine, &config.adapters));
    let coordinator = Arc::new(HttpCoordinationClient::new(&config.coordination)?);
    let orchestrator = Arc::new(
        DualModeOrchestrator::new(
            supervisor.clone(),
            adapters,
            coordinator,
            config.orchestrator.clone(),
            config.coordination.max_subtask_chars,
        )
        .with_event_emitter(events.clone()),
    );

    // =========================================================================
    // Security gate
    // =========================================================================
    let sessions = Arc::new(
        SessionManager::new(&config.security)
            .with_event_emitter(events.clone())
            .with_expiry_hook(Arc::new(StopSandboxesOnExpiry::new(supervisor.clone()))),
    );
    let pruner = sessions.spawn_pruner(Duration::from_secs(config.security.prune_interval_secs));
    let gate = Arc::new(
        SecurityGate::new(&config.security, sessions)?
            .with_event_emitter(events),
    );

    // =========================================================================
    // Start the server
    // =========================================================================
    let dispatcher = Arc::new(CommandDispatcher::new(gate, orchestrator, supervisor.clone()));
    let server = GatewayServer::new(
        config.server.clone(),
        config.security.max_payload_bytes,
        dispatcher,
    )
    .with_metrics(metrics_handle);

    server.run(shutdown_signal()).await?;

    // =========================================================================
    // Teardown
    // =========================================================================
    pruner.abort();
    monitor.stop().await;
    supervisor.shutdown().await;
    tracing::info!("Neural Bridge stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
