//! runbay run orchestrator
//!
//! Claims pending agent runs within per-project slot limits, prepares their
//! environments, launches their jobs and reconciles them to completion.

use std::sync::Arc;

use anyhow::Result;
use runbay_orchestrator::{
    config,
    credentials::{LoggingStatusNotifier, StaticAccessKeyIssuer, StaticMcpTokenIssuer},
    db::Database,
    launcher::InMemoryLauncher,
    preparer::StaticEnvironmentPreparer,
    Collaborators, Orchestrator, OrchestratorWorker,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to RUNBAY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting runbay run orchestrator");
    info!(
        worker_id = %config.orchestrator.worker_id,
        slots_per_project = config.orchestrator.slots_per_project,
        tick_interval_ms = config.orchestrator.tick_interval.as_millis() as u64,
        "Configuration loaded"
    );

    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    // Cluster, preparer and credential backends are in-process here; the
    // queue and event log are the real Postgres stores.
    warn!("Using in-process cluster, preparer and credential backends");
    let deps = Collaborators {
        queue: Arc::new(db.queue_store()),
        events: Arc::new(db.flow_event_store()),
        launcher: Arc::new(InMemoryLauncher::new(
            config.orchestrator.default_namespace.clone(),
        )),
        preparer: Arc::new(StaticEnvironmentPreparer::new()),
        image_checker: None,
        mcp_tokens: Arc::new(StaticMcpTokenIssuer::new()),
        access_keys: Arc::new(StaticAccessKeyIssuer::new()),
        notifier: Arc::new(LoggingStatusNotifier::new()),
    };

    let orchestrator = Arc::new(Orchestrator::new(Arc::new(config.orchestrator), deps)?);
    let worker = OrchestratorWorker::new(orchestrator);

    if config.tick_once {
        let stats = worker.run_once().await?;
        info!(?stats, "Single tick complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    info!("Waiting for orchestrator worker to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Orchestrator worker did not shut down in time");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
