//! Store seams used by the sync layer. `PgStore` is the production implementation,
//! `MemoryStore` backs tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundsync_core::{
    AffiliationRecord, AuthorRecord, DocumentAuthorLink, DocumentRecord, JobFamily, JobRun,
    JournalKey, JournalMetric, JournalTarget, NewJobRun, PersonProfile, ProfileLinkStats,
    PublicationKey, RunCompletion, ScholarAuthorIndices, ScholarPublication, Subject,
    SubjectFilter,
};
use serde_json::Value;
use uuid::Uuid;

use crate::StoreError;

/// Outcome of an insert-or-update keyed on a unique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub id: i64,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunPage {
    pub runs: Vec<JobRun>,
    pub total: i64,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &NewJobRun) -> Result<(), StoreError>;
    /// Returns false when no run with `id` is still running.
    async fn complete_run(&self, id: Uuid, completion: &RunCompletion) -> Result<bool, StoreError>;
    async fn run_by_id(&self, id: Uuid) -> Result<Option<JobRun>, StoreError>;
    async fn latest_completed_run(&self, family: JobFamily) -> Result<Option<JobRun>, StoreError>;
    async fn running_run(&self, family: JobFamily) -> Result<Option<JobRun>, StoreError>;
    async fn list_runs(
        &self,
        family: JobFamily,
        limit: i64,
        offset: i64,
    ) -> Result<RunPage, StoreError>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn config_value(&self, key: &str) -> Result<Option<String>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImportJob {
    pub service: String,
    pub job_type: String,
    pub query_string: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportJobStatus {
    Completed,
    Failed,
}

impl ImportJobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportJobStatus::Completed => "completed",
            ImportJobStatus::Failed => "failed",
        }
    }
}

/// One outbound provider request, as written to the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequestRecord {
    pub import_job_id: Option<i64>,
    pub service: String,
    pub http_method: String,
    pub endpoint: String,
    pub query_params: Value,
    pub request_headers: Value,
    pub response_status: Option<i32>,
    pub response_time_ms: i64,
    pub page_start: Option<i32>,
    pub page_count: Option<i32>,
    pub items_returned: Option<i32>,
    pub error_message: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn open_import_job(&self, job: &NewImportJob) -> Result<i64, StoreError>;
    async fn set_import_job_total(&self, id: i64, total_results: i64) -> Result<(), StoreError>;
    async fn close_import_job(
        &self,
        id: i64,
        status: ImportJobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
    async fn record_api_request(&self, record: &ApiRequestRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SubjectStore: Send + Sync {
    /// Users with a non-blank external id for `family`, ascending by user id.
    async fn eligible_subjects(
        &self,
        family: JobFamily,
        filter: &SubjectFilter,
    ) -> Result<Vec<Subject>, StoreError>;
}

/// Unit of work covering one source document and everything hanging off it.
#[async_trait]
pub trait DocumentTx: Send {
    async fn document_id(&mut self, eid: &str) -> Result<Option<i64>, StoreError>;
    async fn upsert_document(&mut self, doc: &DocumentRecord) -> Result<Upserted, StoreError>;
    async fn affiliation_id(&mut self, afid: &str) -> Result<Option<i64>, StoreError>;
    async fn upsert_affiliation(
        &mut self,
        affiliation: &AffiliationRecord,
    ) -> Result<Upserted, StoreError>;
    async fn author_id(&mut self, external_id: &str) -> Result<Option<i64>, StoreError>;
    /// Keeps a stored ORCID when the incoming one is blank.
    async fn upsert_author(&mut self, author: &AuthorRecord) -> Result<Upserted, StoreError>;
    async fn link_exists(&mut self, document_id: i64, author_id: i64) -> Result<bool, StoreError>;
    async fn upsert_link(&mut self, link: &DocumentAuthorLink) -> Result<Upserted, StoreError>;
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn begin_document(&self) -> Result<Box<dyn DocumentTx>, StoreError>;
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Any row for `journal`, restricted to `year` when given. Matches on the
    /// source id when the journal has one, on the ISSN column otherwise.
    async fn metric_exists(
        &self,
        journal: &JournalKey,
        year: Option<i32>,
    ) -> Result<bool, StoreError>;
    async fn upsert_metric(&self, metric: &JournalMetric) -> Result<Upserted, StoreError>;
    /// Distinct journals referenced by stored documents, with their latest cover date.
    async fn journal_targets(&self) -> Result<Vec<JournalTarget>, StoreError>;
}

#[async_trait]
pub trait PublicationStore: Send + Sync {
    async fn find_publication(&self, key: &PublicationKey) -> Result<Option<i64>, StoreError>;
    async fn insert_publication(&self, publication: &ScholarPublication) -> Result<i64, StoreError>;
    async fn update_publication(
        &self,
        id: i64,
        publication: &ScholarPublication,
    ) -> Result<(), StoreError>;
    async fn upsert_author_indices(
        &self,
        user_id: i64,
        indices: &ScholarAuthorIndices,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn profiles_by_url(&self, urls: &[String]) -> Result<Vec<PersonProfile>, StoreError>;
    async fn upsert_profile(&self, profile: &PersonProfile) -> Result<Upserted, StoreError>;
    /// Attaches unlinked profiles to users by email, then by normalized profile URL.
    async fn link_profiles_to_users(&self) -> Result<ProfileLinkStats, StoreError>;
}

/// Everything the jobs need from persistence.
pub trait Store:
    RunStore
    + ConfigStore
    + AuditStore
    + SubjectStore
    + DocumentStore
    + MetricStore
    + PublicationStore
    + ProfileStore
{
}

impl<T> Store for T where
    T: RunStore
        + ConfigStore
        + AuditStore
        + SubjectStore
        + DocumentStore
        + MetricStore
        + PublicationStore
        + ProfileStore
{
}

/// Normalizes a directory profile URL or stored directory id for matching:
/// lower-cased, scheme, `www.` and directory host stripped, slashes trimmed.
pub fn normalize_profile_ref(input: &str) -> String {
    let mut value = input.trim().to_lowercase();
    for prefix in ["https://", "http://", "www.", "computing.kku.ac.th/"] {
        if let Some(rest) = value.strip_prefix(prefix) {
            value = rest.to_string();
        }
    }
    value.trim_matches('/').to_string()
}
