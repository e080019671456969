//! Orchestrator background worker.
//!
//! Runs the orchestrator tick on a periodic interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::{Orchestrator, OrchestratorError, TickStats};

/// Worker that drives [`Orchestrator::tick`].
pub struct OrchestratorWorker {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl OrchestratorWorker {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let interval = orchestrator.config().tick_interval;
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run ticks until shutdown is signaled. A failed tick is logged and the
    /// next one runs on schedule.
    #[instrument(skip(self, shutdown), fields(worker_id = %self.orchestrator.worker_id()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting orchestrator worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Orchestrator tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Orchestrator worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single tick.
    pub async fn run_once(&self) -> Result<TickStats, OrchestratorError> {
        self.orchestrator.tick().await
    }
}
