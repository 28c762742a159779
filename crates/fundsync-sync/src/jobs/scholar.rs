use std::sync::Arc;

use fundsync_adapters::ScholarSource;
use fundsync_core::{
    JobFamily, RunDiagnostics, RunSummary, ScholarBatchSummary, ScholarCounters, Subject,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{cancellable, BatchReport, BatchRequest, BatchScope, JobContext};
use crate::reconcile::{PublicationReconciler, ReconcileOutcome};
use crate::JobError;

/// Scholar-profile import: publications per author plus their citation indices.
pub struct ScholarJob {
    ctx: JobContext,
    source: Arc<dyn ScholarSource>,
}

impl ScholarJob {
    pub fn new(ctx: JobContext, source: Arc<dyn ScholarSource>) -> Self {
        Self { ctx, source }
    }

    /// Imports one user's profile without the lock or a run record.
    pub async fn import_user(
        &self,
        user_id: i64,
        author_id: &str,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<ScholarCounters, JobError> {
        let author_id = author_id.trim();
        if author_id.is_empty() {
            return Err(JobError::InvalidInput("scholar author id is blank".into()));
        }
        let subject = Subject {
            user_id,
            external_id: author_id.to_string(),
        };
        let mut reconciler = PublicationReconciler::new(Arc::clone(&self.ctx.store), dry_run);
        let mut counters = ScholarCounters::default();
        self.import_subject(&subject, dry_run, &mut reconciler, &mut counters, cancel)
            .await?;
        Ok(counters)
    }

    pub async fn run_batch(
        &self,
        request: &BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, JobError> {
        let scope = BatchScope::open(&self.ctx, JobFamily::ScholarProfile, request).await?;
        let mut summary = ScholarBatchSummary::default();
        let result = self.process(request, &mut summary, cancel).await;
        scope
            .close(
                RunSummary::ScholarProfile(summary),
                RunDiagnostics::default(),
                result,
            )
            .await
    }

    async fn process(
        &self,
        request: &BatchRequest,
        summary: &mut ScholarBatchSummary,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let subjects = self
            .ctx
            .store
            .eligible_subjects(JobFamily::ScholarProfile, &request.subjects)
            .await?;
        info!(subjects = subjects.len(), "scholar subjects resolved");

        let mut reconciler =
            PublicationReconciler::new(Arc::clone(&self.ctx.store), request.dry_run);
        for subject in subjects {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let mut counters = ScholarCounters::default();
            let result = self
                .import_subject(&subject, request.dry_run, &mut reconciler, &mut counters, cancel)
                .await;
            summary.totals.absorb(&counters);
            match result {
                Ok(()) => {
                    summary.subjects_processed += 1;
                    info!(
                        subject_id = subject.user_id,
                        fetched = counters.publications_fetched,
                        created = counters.publications_created,
                        updated = counters.publications_updated,
                        "scholar subject imported"
                    );
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    summary.subjects_with_errors += 1;
                    warn!(subject_id = subject.user_id, error = %err, "scholar subject failed");
                }
            }
        }
        Ok(())
    }

    async fn import_subject(
        &self,
        subject: &Subject,
        dry_run: bool,
        reconciler: &mut PublicationReconciler,
        counters: &mut ScholarCounters,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let entries = cancellable(cancel, self.source.publications(&subject.external_id)).await?;

        if !dry_run {
            self.refresh_indices(subject, counters, cancel).await?;
        }

        for entry in entries {
            counters.publications_fetched += 1;
            let Some(publication) = entry.into_publication(subject.user_id) else {
                counters.publications_failed += 1;
                continue;
            };
            match reconciler.reconcile(&publication).await {
                Ok(ReconcileOutcome::Created) => counters.publications_created += 1,
                Ok(ReconcileOutcome::Updated) | Ok(ReconcileOutcome::Unchanged) => {
                    counters.publications_updated += 1
                }
                Ok(ReconcileOutcome::Duplicate) => counters.duplicates_skipped += 1,
                Err(err) => {
                    counters.publications_failed += 1;
                    warn!(subject_id = subject.user_id, title = %publication.title, error = %err, "publication write failed");
                }
            }
        }
        Ok(())
    }

    /// Best effort: a failed indices fetch or write is logged and skipped.
    async fn refresh_indices(
        &self,
        subject: &Subject,
        counters: &mut ScholarCounters,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let indices =
            match cancellable(cancel, self.source.author_indices(&subject.external_id)).await {
                Ok(indices) => indices,
                Err(JobError::Cancelled) => return Err(JobError::Cancelled),
                Err(err) => {
                    warn!(subject_id = subject.user_id, error = %err, "author indices unavailable");
                    return Ok(());
                }
            };
        match self
            .ctx
            .store
            .upsert_author_indices(subject.user_id, &indices)
            .await
        {
            Ok(()) => counters.indices_refreshed += 1,
            Err(err) => {
                warn!(subject_id = subject.user_id, error = %err, "author indices write failed")
            }
        }
        Ok(())
    }
}
