use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loft_store::Repository;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::{Caller, Orchestrator};

const BATCH: u32 = 100;
const METRIC_RETENTION_DAYS: i64 = 7;

/// Periodic scans that reclaim what nobody is using: idle environments,
/// environments stuck mid-transition, and unreferenced workspace archives.
///
/// Every scan is idempotent and pulls bounded batches, so a crash mid-scan
/// just means the next tick finishes the job.
pub struct Reaper {
    orchestrator: Arc<Orchestrator>,
    repo: Arc<dyn Repository>,
    /// Transitional states older than this are treated as failed.
    stale_after: chrono::Duration,
    archive_retention: chrono::Duration,
}

impl Reaper {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        repo: Arc<dyn Repository>,
        archive_retention_days: u32,
    ) -> Self {
        Self {
            orchestrator,
            repo,
            stale_after: chrono::Duration::hours(24),
            archive_retention: chrono::Duration::days(archive_retention_days as i64),
        }
    }

    /// Stop RUNNING environments idle past their auto-stop threshold.
    pub async fn scan_idle(&self) -> usize {
        let now = Utc::now();
        let candidates = match self.repo.list_running_accessed_before(now, BATCH).await {
            Ok(envs) => envs,
            Err(e) => {
                warn!(error = %e, "idle scan could not list environments");
                return 0;
            }
        };

        let mut stopped = 0;
        for env in candidates {
            if env.auto_stop_after_hours == 0 {
                continue; // auto-stop disabled for this environment
            }
            let idle_limit = chrono::Duration::hours(env.auto_stop_after_hours as i64);
            if env.last_accessed_at + idle_limit >= now {
                continue;
            }
            match self.orchestrator.stop(&Caller::System, env.id).await {
                Ok(handle) => {
                    info!(environment_id = %env.id, "idle environment auto-stopping");
                    let _ = handle.task.await;
                    stopped += 1;
                }
                Err(e) => {
                    // a user beat us to it, or the state changed underneath
                    warn!(environment_id = %env.id, error = %e, "idle auto-stop skipped");
                }
            }
        }
        stopped
    }

    /// Destroy environments stuck in a transitional state for too long.
    pub async fn scan_stale(&self) -> usize {
        let cutoff = Utc::now() - self.stale_after;
        let candidates = match self.repo.list_stale_transitional(cutoff, BATCH).await {
            Ok(envs) => envs,
            Err(e) => {
                warn!(error = %e, "stale scan could not list environments");
                return 0;
            }
        };

        let mut reaped = 0;
        for env in candidates {
            match self.orchestrator.reap_stale(env.id).await {
                Ok(()) => {
                    info!(environment_id = %env.id, stuck_in = %env.status, "stale environment reaped");
                    reaped += 1;
                }
                Err(e) => warn!(environment_id = %env.id, error = %e, "stale reap failed"),
            }
        }
        reaped
    }

    /// Delete unreferenced archives past retention, and prune old metrics.
    pub async fn scan_archives(&self) -> usize {
        let cutoff = Utc::now() - self.archive_retention;
        let orphans = match self.repo.list_unreferenced_archives(cutoff, BATCH).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "archive scan could not list archives");
                return 0;
            }
        };

        let mut deleted = 0;
        for archive in orphans {
            match self.repo.delete_archive(&archive.id).await {
                Ok(()) => {
                    info!(archive_id = %archive.id, "unreferenced archive deleted");
                    deleted += 1;
                }
                Err(e) => warn!(archive_id = %archive.id, error = %e, "archive delete failed"),
            }
        }

        let horizon = Utc::now() - chrono::Duration::days(METRIC_RETENTION_DAYS);
        match self.repo.prune_metrics_before(horizon).await {
            Ok(pruned) if pruned > 0 => info!(pruned, "old metric samples pruned"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "metric prune failed"),
        }
        deleted
    }

    /// Run the three scans on their own timers until shutdown.
    pub fn run(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut idle = tokio::time::interval(Duration::from_secs(60 * 60));
            let mut stale = tokio::time::interval(Duration::from_secs(60 * 60));
            let mut archives = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            // the immediate first tick of each interval is fine: scans are
            // idempotent and cheap on an empty store
            loop {
                tokio::select! {
                    _ = idle.tick() => { self.scan_idle().await; }
                    _ = stale.tick() => { self.scan_stale().await; }
                    _ = archives.tick() => { self.scan_archives().await; }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}
