//! Periodic capture scheduling
//!
//! One task per meter: run, then sleep for the meter's interval, until the
//! cancellation token fires. A failed run is already logged and counted by
//! the orchestrator; the loop simply waits for the next cycle.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Orchestrator;

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    cancel_token: CancellationToken,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, cancel_token: CancellationToken) -> Self {
        Self {
            orchestrator,
            cancel_token,
        }
    }

    /// Spawn one loop per configured meter
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        self.orchestrator
            .meters()
            .iter()
            .map(|meter| {
                let orchestrator = Arc::clone(&self.orchestrator);
                let cancel_token = self.cancel_token.clone();
                let name = meter.name.clone();
                let interval = Duration::from_secs(meter.interval_secs);

                tokio::spawn(async move {
                    info!(meter = %name, interval_secs = interval.as_secs(), "Meter schedule started");
                    while !cancel_token.is_cancelled() {
                        // Runs are never interrupted; shutdown waits for the current one.
                        // Outcomes are recorded in stats and events.
                        let _ = orchestrator.run(&name).await;

                        tokio::select! {
                            _ = cancel_token.cancelled() => break,
                            _ = tokio::time::sleep(interval) => {}
                        }
                    }
                    info!(meter = %name, "Meter schedule stopped");
                })
            })
            .collect()
    }

    /// Spawn all loops and wait until they stop
    pub async fn run(self) {
        let handles = self.spawn();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Meter schedule task panicked");
            }
        }
    }
}
