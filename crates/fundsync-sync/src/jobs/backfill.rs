use std::sync::Arc;

use fundsync_adapters::MetricsSource;
use fundsync_core::{BackfillSummary, JobFamily, RunDiagnostics, RunSummary};
use tokio_util::sync::CancellationToken;

use super::{BatchReport, BatchRequest, BatchScope, JobContext};
use crate::enrich::MetricEnricher;
use crate::JobError;

/// Metric backfill over every journal referenced by stored documents.
pub struct BackfillJob {
    ctx: JobContext,
    source: Arc<dyn MetricsSource>,
}

impl BackfillJob {
    pub fn new(ctx: JobContext, source: Arc<dyn MetricsSource>) -> Self {
        Self { ctx, source }
    }

    /// With `refresh`, journals that already have rows are fetched again.
    pub async fn run_batch(
        &self,
        request: &BatchRequest,
        refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, JobError> {
        let scope = BatchScope::open(&self.ctx, JobFamily::MetricBackfill, request).await?;
        let mut summary = BackfillSummary {
            refresh,
            ..Default::default()
        };
        let result = self
            .backfill(request.dry_run, refresh, &mut summary, cancel)
            .await;
        scope
            .close(
                RunSummary::MetricBackfill(summary),
                RunDiagnostics::default(),
                result,
            )
            .await
    }

    async fn backfill(
        &self,
        dry_run: bool,
        refresh: bool,
        summary: &mut BackfillSummary,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let api_key = self.ctx.api_key().await?;
        MetricEnricher::new(Arc::clone(&self.ctx.store), Arc::clone(&self.source))
            .dry_run(dry_run)
            .backfill(refresh, &api_key, cancel, summary)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, metric, FakeMetrics};
    use fundsync_core::{DocumentRecord, RunStatus};
    use fundsync_storage::{DocumentStore, DocumentTx, MemoryLock, MemoryStore, MetricStore};

    async fn store_with(journals: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        for (i, source_id) in journals.iter().enumerate() {
            let mut tx = store.begin_document().await.unwrap();
            tx.upsert_document(&DocumentRecord {
                eid: format!("e{i}"),
                source_id: Some(source_id.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn backfill_run_records_its_summary() {
        let store = store_with(&["S1", "S2"]).await;
        store.upsert_metric(&metric("S1", 2022, None)).await.unwrap();
        let source = Arc::new(FakeMetrics::default());
        source.fail("S2");
        let job = BackfillJob::new(context(&store, &MemoryLock::default()), source.clone());

        let report = job
            .run_batch(&BatchRequest::new("cli"), false, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.succeeded());
        assert!(report.has_failures());
        assert_eq!(
            report.summary,
            RunSummary::MetricBackfill(BackfillSummary {
                refresh: false,
                journals_scanned: 2,
                metrics_fetched: 0,
                skipped_existing: 1,
                errors: 1,
            })
        );
        assert_eq!(store.runs()[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn cancelled_backfill_fails_the_run() {
        let store = store_with(&["S1"]).await;
        let job = BackfillJob::new(
            context(&store, &MemoryLock::default()),
            Arc::new(FakeMetrics::default()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = job
            .run_batch(&BatchRequest::new("cli"), true, &cancel)
            .await
            .unwrap();
        assert!(matches!(report.failure, Some(JobError::Cancelled)));
        assert_eq!(store.runs()[0].status, RunStatus::Failed);
    }
}
