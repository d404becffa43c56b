use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::cache::{BackupOutcome, EmbeddingCache};

/// Upper bound for one snapshot write.
const BACKUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Periodic CSV snapshot of the shared cache. Only the orchestrator owns one.
pub struct CacheBackupScheduler {
    scheduler: JobScheduler,
    runs: Arc<AtomicU64>,
}

impl CacheBackupScheduler {
    pub async fn start(
        cache: Arc<EmbeddingCache>,
        interval: Duration,
    ) -> Result<Self, JobSchedulerError> {
        let scheduler = JobScheduler::new().await?;
        let runs = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(false));

        let job_runs = runs.clone();
        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let guard = running.clone();
            if guard
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                tracing::warn!("Skipping cache backup: previous run still in progress");
                return Box::pin(async {});
            }
            let cache = cache.clone();
            let runs = job_runs.clone();
            Box::pin(async move {
                match tokio::time::timeout(BACKUP_TIMEOUT, run_backup(&cache)).await {
                    Ok(()) => {
                        runs.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        tracing::error!(
                            timeout_secs = BACKUP_TIMEOUT.as_secs(),
                            "Cache backup timed out"
                        );
                    }
                }
                guard.store(false, Ordering::SeqCst);
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;
        tracing::info!(interval_secs = interval.as_secs(), "Cache backup scheduler started");

        Ok(Self { scheduler, runs })
    }

    /// Completed backup invocations, including ones skipped for a clean cache.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.scheduler.shutdown().await {
            tracing::warn!(error = %e, "Cache backup scheduler shutdown failed");
        }
    }
}

pub async fn run_backup(cache: &EmbeddingCache) {
    match cache.backup_if_dirty().await {
        Ok(BackupOutcome::Written { entries }) => {
            tracing::info!(entries, "Periodic cache backup written");
        }
        Ok(BackupOutcome::Skipped) => {
            tracing::debug!("Cache unchanged, skipping periodic backup");
        }
        Err(e) => {
            tracing::error!(error = %e, "Periodic cache backup failed");
        }
    }
}
