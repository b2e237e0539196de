//! fleetd - declarative workload controller.
//!
//! Converges a fleet of runtime instances toward operator-declared
//! workloads: auto-healing, scaling, and bounded rolling updates.
//!
//! Runs against the mock runtime unless embedded with a real one; the
//! write and observation boundaries are in-process APIs on
//! [`fleet_controller::Controller`].

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_controller::config::Config;
use fleet_controller::{Controller, MockRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleetd controller");

    let config = Config::from_env()?;
    info!(
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        health_poll_interval_secs = config.health_poll_interval.as_secs(),
        max_retries = config.max_retries,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime = Arc::new(MockRuntime::new());
    let controller = Controller::new(runtime, config);
    let workers = controller.spawn_workers(shutdown_rx);

    // Wait for ctrl-c
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown_tx.send(true)?;

    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Worker task failed during shutdown");
        }
    }

    info!("fleetd stopped");
    Ok(())
}
