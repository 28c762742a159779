//! Run history: one record per batch execution, opened as `running` and
//! closed exactly once as `success` or `failed`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fundsync_core::{
    truncate_chars, Clock, JobFamily, JobRun, NewJobRun, RunCompletion, RunDiagnostics, RunStatus,
    RunSummary, SubjectFilter, ERROR_CAP_CHARS, OUTPUT_CAP_CHARS,
};
use fundsync_storage::{RunPage, Store};
use tracing::info;
use uuid::Uuid;

use crate::JobError;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub id: Uuid,
    pub family: JobFamily,
    pub started_at: DateTime<Utc>,
}

/// Non-positive limits fall back to the default page size; limits above the
/// maximum are capped. Negative offsets become zero.
pub fn clamp_page(limit: i64, offset: i64) -> (i64, i64) {
    let limit = if limit <= 0 {
        DEFAULT_PAGE_SIZE
    } else {
        limit.min(MAX_PAGE_SIZE)
    };
    (limit, offset.max(0))
}

#[derive(Clone)]
pub struct RunLedger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RunLedger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn start(
        &self,
        family: JobFamily,
        trigger: &str,
        dry_run: bool,
        subjects: &SubjectFilter,
    ) -> Result<RunHandle, JobError> {
        let trigger = match trigger.trim() {
            "" => "unknown",
            t => t,
        };
        let run = NewJobRun {
            id: Uuid::new_v4(),
            job_family: family,
            trigger_source: trigger.to_string(),
            dry_run,
            started_at: self.clock.now(),
            requested_subject_ids: subjects.user_ids.clone(),
            subject_limit: subjects.limit,
        };
        self.store.insert_run(&run).await?;
        info!(run_id = %run.id, family = %family, trigger, "run started");
        Ok(RunHandle {
            id: run.id,
            family,
            started_at: run.started_at,
        })
    }

    pub async fn mark_success(
        &self,
        handle: &RunHandle,
        summary: RunSummary,
        diagnostics: RunDiagnostics,
    ) -> Result<(), JobError> {
        self.complete(handle, RunStatus::Success, summary, diagnostics, None)
            .await
    }

    pub async fn mark_failure(
        &self,
        handle: &RunHandle,
        summary: RunSummary,
        diagnostics: RunDiagnostics,
        error: &str,
    ) -> Result<(), JobError> {
        self.complete(handle, RunStatus::Failed, summary, diagnostics, Some(error))
            .await
    }

    async fn complete(
        &self,
        handle: &RunHandle,
        status: RunStatus,
        summary: RunSummary,
        diagnostics: RunDiagnostics,
        error: Option<&str>,
    ) -> Result<(), JobError> {
        let finished_at = self.clock.now();
        let duration_ms = (finished_at - handle.started_at).num_milliseconds().max(0);
        let completion = RunCompletion {
            status,
            finished_at,
            duration_ms,
            summary: Some(summary),
            stdout: diagnostics
                .stdout
                .as_deref()
                .map(|s| truncate_chars(s, OUTPUT_CAP_CHARS)),
            stderr: diagnostics
                .stderr
                .as_deref()
                .map(|s| truncate_chars(s, OUTPUT_CAP_CHARS)),
            exit_code: diagnostics.exit_code,
            error_message: error.map(|e| truncate_chars(e, ERROR_CAP_CHARS)),
        };
        if !self.store.complete_run(handle.id, &completion).await? {
            return Err(match self.store.run_by_id(handle.id).await? {
                Some(_) => JobError::RunAlreadyFinished(handle.id),
                None => JobError::RunNotFound(handle.id),
            });
        }
        info!(
            run_id = %handle.id,
            family = %handle.family,
            status = status.as_str(),
            duration_ms,
            "run finished"
        );
        Ok(())
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<JobRun>, JobError> {
        Ok(self.store.run_by_id(id).await?)
    }

    pub async fn get_latest_completed(&self, family: JobFamily) -> Result<Option<JobRun>, JobError> {
        Ok(self.store.latest_completed_run(family).await?)
    }

    pub async fn get_running(&self, family: JobFamily) -> Result<Option<JobRun>, JobError> {
        Ok(self.store.running_run(family).await?)
    }

    pub async fn list(&self, family: JobFamily, limit: i64, offset: i64) -> Result<RunPage, JobError> {
        let (limit, offset) = clamp_page(limit, offset);
        Ok(self.store.list_runs(family, limit, offset).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fundsync_core::{BackfillSummary, ManualClock};
    use fundsync_storage::MemoryStore;

    fn ledger() -> (RunLedger, MemoryStore, Arc<ManualClock>) {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()));
        (
            RunLedger::new(Arc::new(store.clone()), clock.clone()),
            store,
            clock,
        )
    }

    fn summary() -> RunSummary {
        RunSummary::MetricBackfill(BackfillSummary::default())
    }

    #[tokio::test]
    async fn lifecycle_records_duration_and_truncates() {
        let (ledger, store, clock) = ledger();
        let handle = ledger
            .start(JobFamily::PersonnelDirectory, "  ", false, &SubjectFilter::default())
            .await
            .unwrap();
        assert_eq!(ledger.get_running(JobFamily::PersonnelDirectory).await.unwrap().map(|r| r.id), Some(handle.id));

        clock.advance(chrono::Duration::milliseconds(1_500));
        let long_error = "e".repeat(ERROR_CAP_CHARS + 50);
        ledger
            .mark_failure(
                &handle,
                summary(),
                RunDiagnostics {
                    stdout: Some("x".repeat(OUTPUT_CAP_CHARS + 1)),
                    stderr: Some("warn".into()),
                    exit_code: Some(1),
                },
                &long_error,
            )
            .await
            .unwrap();

        let run = store.runs().pop().unwrap();
        assert_eq!(run.trigger_source, "unknown");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.duration_ms, Some(1_500));
        assert_eq!(run.exit_code, Some(1));
        let error = run.error_message.unwrap();
        assert_eq!(error.chars().count(), ERROR_CAP_CHARS);
        assert!(error.ends_with("..."));
        assert_eq!(run.stdout.unwrap().chars().count(), OUTPUT_CAP_CHARS);
        assert_eq!(run.stderr.as_deref(), Some("warn"));

        assert!(ledger.get_running(JobFamily::PersonnelDirectory).await.unwrap().is_none());
        assert_eq!(
            ledger.get_latest_completed(JobFamily::PersonnelDirectory).await.unwrap().map(|r| r.id),
            Some(handle.id)
        );
    }

    #[tokio::test]
    async fn closing_unknown_run_is_reported() {
        let (ledger, _store, clock) = ledger();
        let handle = RunHandle {
            id: Uuid::new_v4(),
            family: JobFamily::CitationIndex,
            started_at: clock.now(),
        };
        let err = ledger
            .mark_success(&handle, summary(), RunDiagnostics::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::RunNotFound(id) if id == handle.id));
    }

    #[tokio::test]
    async fn finished_run_is_not_closed_twice() {
        let (ledger, _store, _clock) = ledger();
        let handle = ledger
            .start(JobFamily::MetricBackfill, "cli", false, &SubjectFilter::default())
            .await
            .unwrap();
        ledger
            .mark_failure(&handle, summary(), RunDiagnostics::default(), "boom")
            .await
            .unwrap();

        let err = ledger
            .mark_success(&handle, summary(), RunDiagnostics::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::RunAlreadyFinished(id) if id == handle.id));
        let run = ledger.get_by_id(handle.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn list_clamps_and_counts_per_family() {
        let (ledger, _store, clock) = ledger();
        for _ in 0..3 {
            ledger
                .start(JobFamily::CitationIndex, "cli", false, &SubjectFilter::default())
                .await
                .unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }
        ledger
            .start(JobFamily::ScholarProfile, "cli", false, &SubjectFilter::default())
            .await
            .unwrap();

        let page = ledger.list(JobFamily::CitationIndex, 0, -5).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.runs.len(), 3);
        assert!(page.runs[0].started_at > page.runs[2].started_at);

        let page = ledger.list(JobFamily::CitationIndex, 2, 2).await.unwrap();
        assert_eq!(page.runs.len(), 1);
    }

    #[test]
    fn page_bounds() {
        assert_eq!(clamp_page(0, -1), (20, 0));
        assert_eq!(clamp_page(-3, 4), (20, 4));
        assert_eq!(clamp_page(500, 0), (100, 0));
        assert_eq!(clamp_page(7, 0), (7, 0));
    }
}
