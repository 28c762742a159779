//! Batch orchestration shared by every job family: lock, run record,
//! cancellation and the terminal bookkeeping.

use std::future::Future;
use std::sync::Arc;

use fundsync_core::{Clock, JobFamily, RunDiagnostics, RunSummary, SubjectFilter};
use fundsync_storage::{LockGuard, LockManager, Store};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api_key::ApiKeyProvider;
use crate::ledger::{RunHandle, RunLedger};
use crate::JobError;

mod backfill;
mod citation;
mod personnel;
mod scholar;

pub use backfill::BackfillJob;
pub use citation::CitationJob;
pub use personnel::PersonnelJob;
pub use scholar::ScholarJob;

/// Shared dependencies of the job families.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn Store>,
    pub locks: Arc<dyn LockManager>,
    pub clock: Arc<dyn Clock>,
    pub ledger: RunLedger,
    pub api_keys: Arc<ApiKeyProvider>,
}

impl JobContext {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<dyn LockManager>,
        clock: Arc<dyn Clock>,
        config_ttl: chrono::Duration,
    ) -> Self {
        Self {
            ledger: RunLedger::new(Arc::clone(&store), Arc::clone(&clock)),
            api_keys: Arc::new(ApiKeyProvider::new(config_ttl, Arc::clone(&clock))),
            store,
            locks,
            clock,
        }
    }

    pub(crate) async fn api_key(&self) -> Result<String, JobError> {
        self.api_keys.get(self.store.as_ref()).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRequest {
    pub subjects: SubjectFilter,
    pub dry_run: bool,
    pub trigger: String,
    /// Overrides the family's lock name. A blank override runs unlocked.
    pub lock_name: Option<String>,
}

impl BatchRequest {
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            ..Default::default()
        }
    }

    /// `None` when locking is disabled for this request.
    pub fn lock_name(&self, family: JobFamily) -> Option<&str> {
        match self.lock_name.as_deref().map(str::trim) {
            None => Some(family.default_lock_name()),
            Some("") => None,
            Some(name) => Some(name),
        }
    }
}

/// What a finished batch reports. `failure` is set when the run was closed as
/// failed; a dry run has no `run_id`.
#[derive(Debug)]
pub struct BatchReport {
    pub run_id: Option<Uuid>,
    pub summary: RunSummary,
    pub failure: Option<JobError>,
}

impl BatchReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Completed, but some subject or item failed along the way.
    pub fn has_failures(&self) -> bool {
        self.summary.has_failures()
    }
}

/// Awaits `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, JobError>
where
    F: Future<Output = Result<T, E>>,
    JobError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JobError::Cancelled),
        result = fut => result.map_err(JobError::from),
    }
}

/// Lock and run record held for the duration of one batch.
pub(crate) struct BatchScope {
    family: JobFamily,
    guard: LockGuard,
    run: Option<RunHandle>,
    ledger: RunLedger,
}

impl BatchScope {
    /// Takes the family lock without waiting, then opens the run record unless
    /// this is a dry run.
    pub(crate) async fn open(
        ctx: &JobContext,
        family: JobFamily,
        request: &BatchRequest,
    ) -> Result<Self, JobError> {
        let guard = match request.lock_name(family) {
            Some(lock_name) => match ctx.locks.try_acquire(lock_name).await? {
                Some(guard) => guard,
                None => {
                    info!(family = %family, lock = lock_name, "batch skipped, lock held elsewhere");
                    return Err(JobError::AlreadyRunning(lock_name.to_string()));
                }
            },
            None => {
                warn!(family = %family, "job lock disabled for this batch");
                LockGuard::disabled()
            }
        };

        let run = if request.dry_run {
            None
        } else {
            match ctx
                .ledger
                .start(family, &request.trigger, false, &request.subjects)
                .await
            {
                Ok(handle) => Some(handle),
                Err(err) => {
                    release(guard).await;
                    return Err(err);
                }
            }
        };

        info!(family = %family, dry_run = request.dry_run, "batch started");
        Ok(Self {
            family,
            guard,
            run,
            ledger: ctx.ledger.clone(),
        })
    }

    /// Closes the run record with `result` and releases the lock. The lock is
    /// released even when closing the record fails.
    pub(crate) async fn close(
        self,
        summary: RunSummary,
        diagnostics: RunDiagnostics,
        result: Result<(), JobError>,
    ) -> Result<BatchReport, JobError> {
        let Self {
            family,
            guard,
            run,
            ledger,
        } = self;

        let recorded = match &run {
            Some(handle) => match &result {
                Ok(()) => {
                    ledger
                        .mark_success(handle, summary.clone(), diagnostics)
                        .await
                }
                Err(err) => {
                    ledger
                        .mark_failure(handle, summary.clone(), diagnostics, &err.to_string())
                        .await
                }
            },
            None => Ok(()),
        };
        release(guard).await;
        recorded?;

        match &result {
            Ok(()) => info!(family = %family, "batch finished"),
            Err(err) => error!(family = %family, error = %err, "batch failed"),
        }
        Ok(BatchReport {
            run_id: run.map(|handle| handle.id),
            summary,
            failure: result.err(),
        })
    }
}

async fn release(guard: LockGuard) {
    let name = guard.name().to_string();
    if let Err(err) = guard.release().await {
        warn!(lock = %name, error = %err, "releasing job lock failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use fundsync_core::{BackfillSummary, RunStatus};
    use fundsync_storage::{MemoryLock, MemoryStore};

    fn summary() -> RunSummary {
        RunSummary::MetricBackfill(BackfillSummary::default())
    }

    #[tokio::test]
    async fn contended_lock_opens_no_run() {
        let store = MemoryStore::new();
        let locks = MemoryLock::default();
        let ctx = context(&store, &locks);
        let request = BatchRequest::new("cli");

        let first = BatchScope::open(&ctx, JobFamily::MetricBackfill, &request)
            .await
            .unwrap();
        let second = BatchScope::open(&ctx, JobFamily::MetricBackfill, &request).await;
        assert!(matches!(second, Err(JobError::AlreadyRunning(name)) if name == "citescore_backfill_job"));
        assert_eq!(store.runs().len(), 1);

        // Another family is independent.
        let other = BatchScope::open(&ctx, JobFamily::PersonnelDirectory, &request)
            .await
            .unwrap();
        other
            .close(summary(), RunDiagnostics::default(), Ok(()))
            .await
            .unwrap();

        first
            .close(summary(), RunDiagnostics::default(), Ok(()))
            .await
            .unwrap();
        assert!(!locks.is_held("citescore_backfill_job"));
    }

    #[tokio::test]
    async fn failure_is_recorded_and_lock_released() {
        let store = MemoryStore::new();
        let locks = MemoryLock::default();
        let ctx = context(&store, &locks);
        let mut request = BatchRequest::new("cli");
        request.lock_name = Some("custom_lock".into());

        let scope = BatchScope::open(&ctx, JobFamily::MetricBackfill, &request)
            .await
            .unwrap();
        assert!(locks.is_held("custom_lock"));
        let report = scope
            .close(summary(), RunDiagnostics::default(), Err(JobError::Cancelled))
            .await
            .unwrap();

        assert!(matches!(report.failure, Some(JobError::Cancelled)));
        let run = ctx
            .ledger
            .get_by_id(report.run_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("cancelled"));
        assert!(!locks.is_held("custom_lock"));
    }

    #[tokio::test]
    async fn dry_run_writes_no_run_record() {
        let store = MemoryStore::new();
        let locks = MemoryLock::default();
        let ctx = context(&store, &locks);
        let request = BatchRequest {
            dry_run: true,
            ..BatchRequest::new("cli")
        };
        let report = BatchScope::open(&ctx, JobFamily::MetricBackfill, &request)
            .await
            .unwrap()
            .close(summary(), RunDiagnostics::default(), Ok(()))
            .await
            .unwrap();
        assert!(report.run_id.is_none());
        assert!(store.runs().is_empty());
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_work() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), JobError> =
            cancellable(&cancel, std::future::pending::<Result<(), JobError>>()).await;
        assert!(matches!(result, Err(JobError::Cancelled)));
    }

    #[test]
    fn lock_name_defaults_per_family_and_blank_disables() {
        let mut request = BatchRequest::new("cli");
        assert_eq!(request.lock_name(JobFamily::CitationIndex), Some("scopus_ingest_job"));
        request.lock_name = Some("  ".into());
        assert_eq!(request.lock_name(JobFamily::CitationIndex), None);
        request.lock_name = Some(" manual ".into());
        assert_eq!(request.lock_name(JobFamily::CitationIndex), Some("manual"));
    }

    #[tokio::test]
    async fn empty_lock_name_runs_unlocked() {
        let store = MemoryStore::new();
        let locks = MemoryLock::default();
        let ctx = context(&store, &locks);
        let request = BatchRequest {
            lock_name: Some(String::new()),
            ..BatchRequest::new("cli")
        };

        let first = BatchScope::open(&ctx, JobFamily::ScholarProfile, &request)
            .await
            .unwrap();
        let second = BatchScope::open(&ctx, JobFamily::ScholarProfile, &request)
            .await
            .unwrap();
        assert!(!locks.is_held("scholar_import_job"));
        assert!(!locks.is_held(""));

        for scope in [first, second] {
            scope
                .close(summary(), RunDiagnostics::default(), Ok(()))
                .await
                .unwrap();
        }
        assert_eq!(store.runs().len(), 2);
    }
}
