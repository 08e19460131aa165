//! bpftune - autonomous kernel tuning daemon
//!
//! Loads tuning plugins, consumes the events their kernel probes emit, and
//! writes adjusted kernel tunables back, rolling everything to its original
//! value on shutdown.

use anyhow::Result;
use bpftune_lib::health::{components, HealthRegistry};
use bpftune_lib::observability::DaemonMetrics;
use bpftune_lib::supervisor::{ExitStatus, Supervisor};
use bpftune_lib::tuners::builtin_factories;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    match run().await {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            error!(error = %e, "initialization failed");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitStatus> {
    info!(version = DAEMON_VERSION, "starting bpftune");

    let config = config::DaemonConfig::load()?;
    info!(plugin_dir = %config.plugin_dir, netns = config.netns, "daemon configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::RING).await;
    health_registry.register(components::HOST).await;
    health_registry.register(components::REGISTRY).await;
    health_registry.register(components::NETNS).await;

    let metrics = DaemonMetrics::new();

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    tokio::spawn(api::serve(config.api_port, app_state));

    let supervisor = Supervisor::new(config.supervisor(), builtin_factories());

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    health_registry.set_ready(true).await;

    let status = supervisor.run(shutdown_rx).await;
    if status != ExitStatus::Clean {
        health_registry
            .set_unhealthy(components::RING, "supervisor exited abnormally")
            .await;
    }
    info!(code = status.code(), "bpftune stopped");
    Ok(status)
}

async fn wait_for_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
