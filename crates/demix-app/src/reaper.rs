//! Periodic reclamation of abandoned workspaces and expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use demix_workspace::ReclaimReport;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::error::describe;
use crate::orchestrator::JobOrchestrator;

/// Summary of one [`JobOrchestrator::reap_abandoned`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Workspaces that were reclaimed, fully or partially.
    pub reclaimed: Vec<ReclaimReport>,
    /// How many of those had no registry entry.
    pub orphans: usize,
    /// Idle jobs left alone because they are still staged or running.
    pub skipped_in_flight: usize,
    /// Idle jobs left alone because a download holds a lease.
    pub skipped_leased: usize,
    /// Workspaces whose reclamation failed outright.
    pub errors: usize,
}

impl ReapReport {
    /// Whether every reclaimed workspace was removed completely.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.reclaimed.iter().all(ReclaimReport::is_complete)
    }
}

/// Sweep every `every`, reclaiming workspaces idle for longer than `max_age` and
/// purging expired cache entries. The task runs until its handle is aborted.
#[must_use]
pub fn spawn_reaper(
    orchestrator: Arc<JobOrchestrator>,
    every: Duration,
    max_age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match orchestrator.reap_abandoned(max_age).await {
                Ok(report) => debug!(
                    reclaimed = report.reclaimed.len(),
                    orphans = report.orphans,
                    "reaper sweep finished"
                ),
                Err(err) => warn!(error = %describe(&err), "reaper sweep failed"),
            }
            if let Some(cache) = orchestrator.cache().cloned() {
                match tokio::task::spawn_blocking(move || cache.purge_expired()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(error = %describe(&err), "cache expiry sweep failed"),
                    Err(err) => warn!(error = %err, "cache expiry task failed"),
                }
            }
        }
    })
}
