//! Job orchestration: run ledger, entity reconciliation, metric enrichment and
//! the per-family batch jobs built on top of them.

use fundsync_adapters::SourceError;
use fundsync_storage::StoreError;
use thiserror::Error;
use uuid::Uuid;

pub mod api_key;
pub mod config;
pub mod enrich;
pub mod jobs;
pub mod ledger;
pub mod reconcile;
pub mod scheduler;

pub use api_key::ApiKeyProvider;
pub use config::{Providers, SyncConfig};
pub use enrich::{EnrichOutcome, MetricEnricher};
pub use jobs::{
    BatchReport, BatchRequest, BackfillJob, CitationJob, JobContext, PersonnelJob, ScholarJob,
};
pub use ledger::{RunHandle, RunLedger};
pub use reconcile::{DocumentReconciler, ProfileReconciler, PublicationReconciler, ReconcileOutcome};
pub use scheduler::{build_scheduler, run_until, ScheduledJobs};

pub const CRATE_NAME: &str = "fundsync-sync";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("job lock {0} is held by another run")]
    AlreadyRunning(String),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("run {0} is already finished")]
    RunAlreadyFinished(Uuid),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl JobError {
    /// Errors that end the whole batch instead of one subject.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JobError::Config(_) | JobError::Cancelled | JobError::AlreadyRunning(_)
        )
    }
}

#[cfg(test)]
pub(crate) mod testing;
