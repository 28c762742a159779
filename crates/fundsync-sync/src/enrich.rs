//! Journal-level metric enrichment: on demand after a new document, or as a
//! backfill pass over every journal referenced by stored documents.

use std::collections::HashSet;
use std::sync::Arc;

use fundsync_adapters::MetricsSource;
use fundsync_core::{BackfillSummary, JournalKey, JournalTarget};
use fundsync_storage::Store;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::cancellable;
use crate::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// No ISSN or source id to look up.
    Skipped,
    /// This journal was already requested earlier in the run.
    AlreadyRequested,
    /// Rows for the year are already stored.
    Existing,
    Fetched { rows: usize },
}

/// Deduplicates metric requests per journal for the lifetime of one run.
pub struct MetricEnricher {
    store: Arc<dyn Store>,
    source: Arc<dyn MetricsSource>,
    requested: HashSet<String>,
    dry_run: bool,
}

impl MetricEnricher {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn MetricsSource>) -> Self {
        Self {
            store,
            source,
            requested: HashSet::new(),
            dry_run: false,
        }
    }

    /// In dry-run mode backfill counts the journals it would fetch.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Fetches metrics for `journal` unless already requested this run or
    /// already stored for `year`. An unknown year skips the stored check.
    pub async fn ensure(
        &mut self,
        journal: &JournalKey,
        year: Option<i32>,
        api_key: &str,
        cancel: &CancellationToken,
    ) -> Result<EnrichOutcome, JobError> {
        if journal.metric_identity().is_none() {
            return Ok(EnrichOutcome::Skipped);
        }
        if !self.requested.insert(journal.dedupe_key()) {
            return Ok(EnrichOutcome::AlreadyRequested);
        }
        if let Some(year) = year {
            if self.store.metric_exists(journal, Some(year)).await? {
                return Ok(EnrichOutcome::Existing);
            }
        }
        let rows = self.fetch_and_store(journal, api_key, cancel).await?;
        Ok(EnrichOutcome::Fetched { rows })
    }

    async fn fetch_and_store(
        &self,
        journal: &JournalKey,
        api_key: &str,
        cancel: &CancellationToken,
    ) -> Result<usize, JobError> {
        let metrics = cancellable(cancel, self.source.journal_metrics(journal, api_key)).await?;
        for metric in &metrics {
            self.store.upsert_metric(metric).await?;
        }
        debug!(journal = %journal.dedupe_key(), rows = metrics.len(), "journal metrics stored");
        Ok(metrics.len())
    }

    /// One pass over stored journals. Without `refresh`, journals that already
    /// have any metric row are skipped. Per-journal failures are counted.
    pub async fn backfill(
        &mut self,
        refresh: bool,
        api_key: &str,
        cancel: &CancellationToken,
        summary: &mut BackfillSummary,
    ) -> Result<(), JobError> {
        summary.refresh = refresh;
        let targets = self.store.journal_targets().await?;
        summary.journals_scanned = targets.len();

        for target in targets {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            match self.backfill_one(&target, refresh, api_key, cancel).await {
                Ok(Some(_)) => summary.metrics_fetched += 1,
                Ok(None) => summary.skipped_existing += 1,
                Err(JobError::Cancelled) => return Err(JobError::Cancelled),
                Err(err) => {
                    summary.errors += 1;
                    warn!(journal = %target.key.dedupe_key(), error = %err, "journal metric backfill failed");
                }
            }
        }

        info!(
            scanned = summary.journals_scanned,
            fetched = summary.metrics_fetched,
            skipped = summary.skipped_existing,
            errors = summary.errors,
            refresh,
            "metric backfill pass finished"
        );
        Ok(())
    }

    /// `Ok(None)` when the journal was skipped.
    async fn backfill_one(
        &mut self,
        target: &JournalTarget,
        refresh: bool,
        api_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, JobError> {
        if target.key.metric_identity().is_none() {
            return Ok(None);
        }
        if !refresh && self.store.metric_exists(&target.key, None).await? {
            return Ok(None);
        }
        if !self.requested.insert(target.key.dedupe_key()) {
            return Ok(None);
        }
        if self.dry_run {
            return Ok(Some(0));
        }
        debug!(
            journal = %target.key.dedupe_key(),
            latest_cover_date = ?target.latest_cover_date,
            "fetching journal metrics"
        );
        self.fetch_and_store(&target.key, api_key, cancel)
            .await
            .map(Some)
    }
}
