use std::sync::Arc;

use chrono::Datelike;
use fundsync_adapters::scopus::{self, normalize_entry, NormalizedEntry, PageRequest, PAGE_SIZE};
use fundsync_adapters::{CitationSource, MetricsSource};
use fundsync_core::{
    CitationBatchSummary, CitationCounters, JobFamily, RunDiagnostics, RunSummary, Subject,
};
use fundsync_storage::{ImportJobStatus, NewImportJob};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{cancellable, BatchReport, BatchRequest, BatchScope, JobContext};
use crate::enrich::{EnrichOutcome, MetricEnricher};
use crate::reconcile::{DocumentReconciler, ReconcileOutcome};
use crate::JobError;

/// Citation-index ingestion: every document of an author, page by page.
pub struct CitationJob {
    ctx: JobContext,
    source: Arc<dyn CitationSource>,
    metrics: Arc<dyn MetricsSource>,
}

/// Per-batch state shared across subjects.
struct Pass {
    api_key: String,
    dry_run: bool,
    reconciler: DocumentReconciler,
    enricher: MetricEnricher,
}

impl CitationJob {
    pub fn new(
        ctx: JobContext,
        source: Arc<dyn CitationSource>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            ctx,
            source,
            metrics,
        }
    }

    fn pass(&self, api_key: String, dry_run: bool) -> Pass {
        Pass {
            api_key,
            dry_run,
            reconciler: DocumentReconciler::new(Arc::clone(&self.ctx.store), dry_run),
            enricher: MetricEnricher::new(Arc::clone(&self.ctx.store), Arc::clone(&self.metrics)),
        }
    }

    /// Ingests one author without taking the lock or opening a run record.
    pub async fn ingest_author(
        &self,
        author_id: &str,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<CitationCounters, JobError> {
        let author_id = author_id.trim();
        if author_id.is_empty() {
            return Err(JobError::InvalidInput("author id is blank".into()));
        }
        let mut pass = self.pass(self.ctx.api_key().await?, dry_run);
        let mut counters = CitationCounters::default();
        self.ingest_subject(author_id, &mut pass, &mut counters, cancel)
            .await?;
        Ok(counters)
    }

    pub async fn run_batch(
        &self,
        request: &BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, JobError> {
        let scope = BatchScope::open(&self.ctx, JobFamily::CitationIndex, request).await?;
        let mut summary = CitationBatchSummary::default();
        let result = self.process(request, &mut summary, cancel).await;
        scope
            .close(
                RunSummary::CitationIndex(summary),
                RunDiagnostics::default(),
                result,
            )
            .await
    }

    async fn process(
        &self,
        request: &BatchRequest,
        summary: &mut CitationBatchSummary,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let subjects = self
            .ctx
            .store
            .eligible_subjects(JobFamily::CitationIndex, &request.subjects)
            .await?;
        info!(subjects = subjects.len(), "citation subjects resolved");

        let mut pass = self.pass(String::new(), request.dry_run);
        for subject in subjects {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            pass.api_key = self.ctx.api_key().await?;

            let mut counters = CitationCounters::default();
            let result = self
                .ingest_subject(&subject.external_id, &mut pass, &mut counters, cancel)
                .await;
            summary.totals.absorb(&counters);
            match result {
                Ok(()) => {
                    summary.subjects_processed += 1;
                    log_subject(&subject, &counters);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    summary.subjects_with_errors += 1;
                    warn!(subject_id = subject.user_id, author_id = %subject.external_id, error = %err, "citation subject failed");
                }
            }
        }
        Ok(())
    }

    async fn ingest_subject(
        &self,
        author_id: &str,
        pass: &mut Pass,
        counters: &mut CitationCounters,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let import_job = if pass.dry_run {
            None
        } else {
            self.open_import_job(author_id).await
        };

        let result = self
            .page_loop(author_id, import_job, pass, counters, cancel)
            .await;

        if let Some(id) = import_job {
            let (status, error) = match &result {
                Ok(()) => (ImportJobStatus::Completed, None),
                Err(err) => (ImportJobStatus::Failed, Some(err.to_string())),
            };
            if let Err(err) = self
                .ctx
                .store
                .close_import_job(id, status, error.as_deref())
                .await
            {
                warn!(import_job_id = id, error = %err, "closing import job failed");
            }
        }
        result
    }

    async fn open_import_job(&self, author_id: &str) -> Option<i64> {
        let job = NewImportJob {
            service: scopus::SERVICE.to_string(),
            job_type: "author_documents".to_string(),
            query_string: format!("AU-ID({author_id})"),
            started_at: self.ctx.clock.now(),
        };
        match self.ctx.store.open_import_job(&job).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(author_id, error = %err, "opening import job failed");
                None
            }
        }
    }

    async fn page_loop(
        &self,
        author_id: &str,
        import_job: Option<i64>,
        pass: &mut Pass,
        counters: &mut CitationCounters,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let mut start = 0usize;
        let mut total: Option<usize> = None;
        loop {
            let request = PageRequest {
                author_id,
                start,
                count: PAGE_SIZE,
                api_key: &pass.api_key,
                import_job_id: import_job,
                record: !pass.dry_run,
            };
            let page = cancellable(cancel, self.source.fetch_page(&request)).await?;

            if total.is_none() {
                total = Some(page.total_results);
                if let Some(id) = import_job {
                    if let Err(err) = self
                        .ctx
                        .store
                        .set_import_job_total(id, page.total_results as i64)
                        .await
                    {
                        warn!(import_job_id = id, error = %err, "recording result total failed");
                    }
                }
            }
            if page.entries.is_empty() {
                break;
            }

            for raw in &page.entries {
                counters.documents_fetched += 1;
                let entry = match normalize_entry(raw) {
                    Ok(entry) => entry,
                    Err(err) => {
                        counters.documents_failed += 1;
                        warn!(author_id, error = %err, "skipping malformed entry");
                        continue;
                    }
                };
                match pass.reconciler.reconcile(&entry, counters).await {
                    Ok(ReconcileOutcome::Created) if !pass.dry_run => {
                        self.enrich(&entry, pass, counters, cancel).await?;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        counters.documents_failed += 1;
                        warn!(eid = %entry.document.eid, error = %err, "document write failed");
                    }
                }
            }

            start += page.entries.len();
            let bound = total.unwrap_or(page.total_results);
            debug!(author_id, start, total = bound, "page processed");
            if start >= bound {
                break;
            }
        }
        Ok(())
    }

    /// Enrichment failures are counted and never fail the document.
    async fn enrich(
        &self,
        entry: &NormalizedEntry,
        pass: &mut Pass,
        counters: &mut CitationCounters,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let journal = entry.document.journal_key();
        let year = entry.document.cover_date.map(|date| date.year());
        match pass
            .enricher
            .ensure(&journal, year, &pass.api_key, cancel)
            .await
        {
            Ok(EnrichOutcome::Fetched { rows }) => {
                counters.metrics_requested += 1;
                counters.metrics_upserted += rows;
            }
            Ok(_) => {}
            Err(JobError::Cancelled) => return Err(JobError::Cancelled),
            Err(err) => {
                counters.metrics_requested += 1;
                counters.metric_errors += 1;
                warn!(eid = %entry.document.eid, journal = %journal.dedupe_key(), error = %err, "metric enrichment failed");
            }
        }
        Ok(())
    }
}

fn log_subject(subject: &Subject, counters: &CitationCounters) {
    info!(
        subject_id = subject.user_id,
        fetched = counters.documents_fetched,
        created = counters.documents_created,
        updated = counters.documents_updated,
        failed = counters.documents_failed,
        "citation subject ingested"
    );
}
