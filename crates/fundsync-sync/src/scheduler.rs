use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use fundsync_core::JobFamily;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::jobs::{BackfillJob, BatchReport, BatchRequest, CitationJob, PersonnelJob, ScholarJob};
use crate::JobError;

const TRIGGER: &str = "scheduler";

/// The batch jobs the scheduler can fire.
#[derive(Clone)]
pub struct ScheduledJobs {
    pub citation: Arc<CitationJob>,
    pub scholar: Arc<ScholarJob>,
    pub personnel: Arc<PersonnelJob>,
    pub backfill: Arc<BackfillJob>,
}

/// `None` when scheduling is disabled. Each family runs on its own cron line;
/// an overlapping tick that finds the lock held is logged and skipped.
pub async fn build_scheduler(
    config: &SyncConfig,
    jobs: ScheduledJobs,
    cancel: CancellationToken,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let entries = [
        (JobFamily::CitationIndex, config.scopus_ingest_cron.as_str()),
        (JobFamily::ScholarProfile, config.scholar_import_cron.as_str()),
        (JobFamily::PersonnelDirectory, config.people_import_cron.as_str()),
        (JobFamily::MetricBackfill, config.metrics_backfill_cron.as_str()),
    ];
    for (family, cron) in entries {
        let jobs = jobs.clone();
        let cancel = cancel.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let jobs = jobs.clone();
            let cancel = cancel.clone();
            Box::pin(async move { fire(family, jobs, cancel).await })
        })
        .with_context(|| format!("creating scheduler job for {family} with cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(family = %family, cron, "scheduled");
    }
    Ok(Some(sched))
}

async fn fire(family: JobFamily, jobs: ScheduledJobs, cancel: CancellationToken) {
    if cancel.is_cancelled() {
        return;
    }
    let request = BatchRequest::new(TRIGGER);
    info!(family = %family, "scheduled batch triggered");
    let outcome = match family {
        JobFamily::CitationIndex => jobs.citation.run_batch(&request, &cancel).await,
        JobFamily::ScholarProfile => jobs.scholar.run_batch(&request, &cancel).await,
        JobFamily::PersonnelDirectory => jobs.personnel.run_batch(&request, false, &cancel).await,
        JobFamily::MetricBackfill => jobs.backfill.run_batch(&request, false, &cancel).await,
    };
    log_outcome(family, outcome);
}

fn log_outcome(family: JobFamily, outcome: Result<BatchReport, JobError>) {
    match outcome {
        Ok(report) => match &report.failure {
            None if report.has_failures() => {
                warn!(family = %family, run_id = ?report.run_id, "scheduled batch finished with failures")
            }
            None => info!(family = %family, run_id = ?report.run_id, "scheduled batch finished"),
            Some(err) => {
                error!(family = %family, run_id = ?report.run_id, error = %err, "scheduled batch failed")
            }
        },
        Err(JobError::AlreadyRunning(lock)) => {
            info!(family = %family, lock = %lock, "previous batch still running, tick skipped")
        }
        Err(err) => error!(family = %family, error = %err, "scheduled batch could not start"),
    }
}

/// Runs `until` while the scheduler fires, then shuts it down.
pub async fn run_until<F>(mut sched: JobScheduler, until: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    sched.start().await.context("starting scheduler")?;
    until.await;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, FakeCitations, FakeDirectory, FakeMetrics, FakeScholar};
    use fundsync_storage::{LockManager, MemoryLock, MemoryStore};

    fn jobs(store: &MemoryStore, locks: &MemoryLock) -> ScheduledJobs {
        let ctx = context(store, locks);
        let metrics = Arc::new(FakeMetrics::default());
        ScheduledJobs {
            citation: Arc::new(CitationJob::new(
                ctx.clone(),
                Arc::new(FakeCitations::default()),
                metrics.clone(),
            )),
            scholar: Arc::new(ScholarJob::new(ctx.clone(), Arc::new(FakeScholar::default()))),
            personnel: Arc::new(PersonnelJob::new(ctx.clone(), Arc::new(FakeDirectory::new(Vec::new())))),
            backfill: Arc::new(BackfillJob::new(ctx, metrics)),
        }
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let store = MemoryStore::new();
        let locks = MemoryLock::default();
        let config = SyncConfig {
            scheduler_enabled: false,
            ..SyncConfig::from_env()
        };
        let built = build_scheduler(&config, jobs(&store, &locks), CancellationToken::new())
            .await
            .unwrap();
        assert!(built.is_none());
    }

    #[tokio::test]
    async fn tick_with_held_lock_is_skipped() {
        let store = MemoryStore::new();
        let locks = MemoryLock::default();
        let _held = locks.try_acquire("scholar_import_job").await.unwrap();
        fire(JobFamily::ScholarProfile, jobs(&store, &locks), CancellationToken::new()).await;
        assert!(store.runs().is_empty());

        fire(JobFamily::CitationIndex, jobs(&store, &locks), CancellationToken::new()).await;
        let runs = store.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger_source, "scheduler");
    }
}
