//! Periodic per-source sync runs.
//!
//! Each source gets its own task and interval, so a slow or failing source
//! never delays the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::sync::{SyncFilters, SyncOrchestrator};

/// Wait before retrying a run whose source was unreachable.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

pub struct ScheduledSync {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub interval: Duration,
}

impl ScheduledSync {
    #[must_use]
    pub const fn new(orchestrator: Arc<SyncOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }
}

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Starts one loop per entry. The first run happens immediately.
    #[must_use]
    pub fn spawn(schedule: Vec<ScheduledSync>, retry_delay: Duration) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = schedule
            .into_iter()
            .map(|entry| tokio::spawn(source_loop(entry, retry_delay, shutdown_rx.clone())))
            .collect();
        Self { shutdown, handles }
    }

    /// Signals every loop and waits for runs in progress to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Sync loop ended abnormally");
            }
        }
    }
}

async fn source_loop(entry: ScheduledSync, retry_delay: Duration, mut shutdown: watch::Receiver<bool>) {
    let source = entry.orchestrator.source_type();
    let mut ticker = time::interval(entry.interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(%source, interval_secs = entry.interval.as_secs(), "Scheduled source sync");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        if run_once(&entry.orchestrator).await || retry_delay >= entry.interval {
            continue;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            () = time::sleep(retry_delay) => {}
        }
        tracing::info!(%source, "Retrying failed sync");
        run_once(&entry.orchestrator).await;
    }

    tracing::debug!(%source, "Sync loop stopped");
}

/// Returns false when the whole run failed.
async fn run_once(orchestrator: &SyncOrchestrator) -> bool {
    match orchestrator.run(&SyncFilters::default()).await {
        Ok(summary) => {
            tracing::debug!(
                source = %summary.source,
                synced = summary.synced,
                failed = summary.failed,
                "Scheduled sync finished"
            );
            true
        }
        Err(e) => {
            tracing::warn!(source = %orchestrator.source_type(), error = %e, "Scheduled sync failed");
            false
        }
    }
}
