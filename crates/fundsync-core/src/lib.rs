//! Core domain model for fundsync: job runs, external entities and run summaries.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod clock;
pub mod coerce;

pub use clock::{Clock, ManualClock, SystemClock};

pub const CRATE_NAME: &str = "fundsync-core";

/// Cap applied to captured subprocess output stored on a run record.
pub const OUTPUT_CAP_CHARS: usize = 100_000;
/// Cap applied to the error message stored on a run record.
pub const ERROR_CAP_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFamily {
    CitationIndex,
    ScholarProfile,
    PersonnelDirectory,
    MetricBackfill,
}

impl JobFamily {
    pub const ALL: [JobFamily; 4] = [
        JobFamily::CitationIndex,
        JobFamily::ScholarProfile,
        JobFamily::PersonnelDirectory,
        JobFamily::MetricBackfill,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobFamily::CitationIndex => "citation_index",
            JobFamily::ScholarProfile => "scholar_profile",
            JobFamily::PersonnelDirectory => "personnel_directory",
            JobFamily::MetricBackfill => "metric_backfill",
        }
    }

    pub fn default_lock_name(self) -> &'static str {
        match self {
            JobFamily::CitationIndex => "scopus_ingest_job",
            JobFamily::ScholarProfile => "scholar_import_job",
            JobFamily::PersonnelDirectory => "kku_people_import_job",
            JobFamily::MetricBackfill => "citescore_backfill_job",
        }
    }
}

impl fmt::Display for JobFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobFamily::ALL
            .into_iter()
            .find(|family| family.as_str() == s.trim())
            .ok_or_else(|| format!("unknown job family: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One row of execution history for a job family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_family: JobFamily,
    pub trigger_source: String,
    pub dry_run: bool,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub summary: Option<RunSummary>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub requested_subject_ids: Vec<i64>,
    pub subject_limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJobRun {
    pub id: Uuid,
    pub job_family: JobFamily,
    pub trigger_source: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub requested_subject_ids: Vec<i64>,
    pub subject_limit: Option<i64>,
}

/// The single terminal update applied to a running job run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub summary: Option<RunSummary>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

/// Captured subprocess output attached to a run when it closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunDiagnostics {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationCounters {
    pub documents_fetched: usize,
    pub documents_created: usize,
    pub documents_updated: usize,
    pub documents_failed: usize,
    pub authors_created: usize,
    pub authors_updated: usize,
    pub affiliations_created: usize,
    pub affiliations_updated: usize,
    pub links_created: usize,
    pub links_updated: usize,
    pub metrics_requested: usize,
    pub metrics_upserted: usize,
    pub metric_errors: usize,
}

impl CitationCounters {
    pub fn absorb(&mut self, other: &CitationCounters) {
        self.documents_fetched += other.documents_fetched;
        self.documents_created += other.documents_created;
        self.documents_updated += other.documents_updated;
        self.documents_failed += other.documents_failed;
        self.authors_created += other.authors_created;
        self.authors_updated += other.authors_updated;
        self.affiliations_created += other.affiliations_created;
        self.affiliations_updated += other.affiliations_updated;
        self.links_created += other.links_created;
        self.links_updated += other.links_updated;
        self.metrics_requested += other.metrics_requested;
        self.metrics_upserted += other.metrics_upserted;
        self.metric_errors += other.metric_errors;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationBatchSummary {
    pub subjects_processed: usize,
    pub subjects_with_errors: usize,
    pub totals: CitationCounters,
}

impl CitationBatchSummary {
    pub fn has_failures(&self) -> bool {
        self.subjects_with_errors > 0 || self.totals.documents_failed > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScholarCounters {
    pub publications_fetched: usize,
    pub publications_created: usize,
    pub publications_updated: usize,
    pub publications_failed: usize,
    pub duplicates_skipped: usize,
    pub indices_refreshed: usize,
}

impl ScholarCounters {
    pub fn absorb(&mut self, other: &ScholarCounters) {
        self.publications_fetched += other.publications_fetched;
        self.publications_created += other.publications_created;
        self.publications_updated += other.publications_updated;
        self.publications_failed += other.publications_failed;
        self.duplicates_skipped += other.duplicates_skipped;
        self.indices_refreshed += other.indices_refreshed;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScholarBatchSummary {
    pub subjects_processed: usize,
    pub subjects_with_errors: usize,
    pub totals: ScholarCounters,
}

impl ScholarBatchSummary {
    pub fn has_failures(&self) -> bool {
        self.subjects_with_errors > 0 || self.totals.publications_failed > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonnelSummary {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub duplicates_skipped: usize,
    pub linked_by_email: usize,
    pub linked_by_profile_url: usize,
}

impl PersonnelSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub refresh: bool,
    pub journals_scanned: usize,
    pub metrics_fetched: usize,
    pub skipped_existing: usize,
    pub errors: usize,
}

impl BackfillSummary {
    pub fn has_failures(&self) -> bool {
        self.errors > 0
    }
}

/// Per-family counters persisted on the run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum RunSummary {
    CitationIndex(CitationBatchSummary),
    ScholarProfile(ScholarBatchSummary),
    PersonnelDirectory(PersonnelSummary),
    MetricBackfill(BackfillSummary),
}

impl RunSummary {
    pub fn family(&self) -> JobFamily {
        match self {
            RunSummary::CitationIndex(_) => JobFamily::CitationIndex,
            RunSummary::ScholarProfile(_) => JobFamily::ScholarProfile,
            RunSummary::PersonnelDirectory(_) => JobFamily::PersonnelDirectory,
            RunSummary::MetricBackfill(_) => JobFamily::MetricBackfill,
        }
    }

    /// Some subject or item failed even though the batch completed.
    pub fn has_failures(&self) -> bool {
        match self {
            RunSummary::CitationIndex(s) => s.has_failures(),
            RunSummary::ScholarProfile(s) => s.has_failures(),
            RunSummary::PersonnelDirectory(s) => s.has_failures(),
            RunSummary::MetricBackfill(s) => s.has_failures(),
        }
    }
}

/// Internal user eligible for a per-subject job, with their id at the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub user_id: i64,
    pub external_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectFilter {
    pub user_ids: Vec<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub eid: String,
    pub scopus_id: Option<String>,
    pub scopus_link: Option<String>,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub aggregation_type: Option<String>,
    pub subtype: Option<String>,
    pub subtype_description: Option<String>,
    pub source_id: Option<String>,
    pub publication_name: Option<String>,
    pub issn: Option<String>,
    pub eissn: Option<String>,
    pub isbn: Option<String>,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub page_range: Option<String>,
    pub article_number: Option<String>,
    pub cover_date: Option<NaiveDate>,
    pub cover_display_date: Option<String>,
    pub doi: Option<String>,
    pub pii: Option<String>,
    pub citedby_count: Option<i32>,
    pub open_access: Option<bool>,
    pub open_access_flag: Option<bool>,
    pub author_keywords: Vec<String>,
    pub fund_acronym: Option<String>,
    pub fund_sponsor: Option<String>,
    pub raw: serde_json::Value,
}

impl DocumentRecord {
    pub fn journal_key(&self) -> JournalKey {
        JournalKey {
            issn: self.issn.clone(),
            source_id: self.source_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRecord {
    pub author_id: String,
    pub full_name: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub initials: Option<String>,
    pub orcid: Option<String>,
    pub author_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliationRecord {
    pub afid: String,
    pub name: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentAuthorLink {
    pub document_id: i64,
    pub author_id: i64,
    pub author_seq: i32,
    pub affiliation_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricMatch<'a> {
    SourceId(&'a str),
    Issn(&'a str),
}

/// Journal identity as carried on a stored document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JournalKey {
    pub issn: Option<String>,
    pub source_id: Option<String>,
}

impl JournalKey {
    /// `issn|source_id`, used to deduplicate metric requests within a run.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}|{}",
            self.issn.as_deref().unwrap_or_default().trim(),
            self.source_id.as_deref().unwrap_or_default().trim()
        )
    }

    /// Identifier sent to the metrics endpoint: ISSN first, source id otherwise.
    pub fn lookup_id(&self) -> Option<&str> {
        non_blank(self.issn.as_deref()).or_else(|| non_blank(self.source_id.as_deref()))
    }

    /// Identifier metric rows are stored under: source id first, ISSN otherwise.
    pub fn metric_identity(&self) -> Option<&str> {
        non_blank(self.source_id.as_deref()).or_else(|| non_blank(self.issn.as_deref()))
    }

    /// Column stored metric rows are matched on for this journal. Rows are
    /// keyed by the provider's source id, so an ISSN-only journal matches on
    /// the ISSN column instead.
    pub fn metric_match(&self) -> Option<MetricMatch<'_>> {
        match non_blank(self.source_id.as_deref()) {
            Some(source_id) => Some(MetricMatch::SourceId(source_id)),
            None => non_blank(self.issn.as_deref()).map(MetricMatch::Issn),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lookup_id().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalTarget {
    pub key: JournalKey,
    pub latest_cover_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quartile {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quartile {
    pub fn as_str(self) -> &'static str {
        match self {
            Quartile::Q1 => "Q1",
            Quartile::Q2 => "Q2",
            Quartile::Q3 => "Q3",
            Quartile::Q4 => "Q4",
        }
    }
}

/// Fixed threshold table: >=75 Q1, >=50 Q2, >=25 Q3, >0 Q4, otherwise none.
pub fn percentile_to_quartile(percentile: Option<f64>) -> Option<Quartile> {
    match percentile {
        Some(p) if p >= 75.0 => Some(Quartile::Q1),
        Some(p) if p >= 50.0 => Some(Quartile::Q2),
        Some(p) if p >= 25.0 => Some(Quartile::Q3),
        Some(p) if p > 0.0 => Some(Quartile::Q4),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalMetric {
    pub source_id: String,
    pub issn: Option<String>,
    pub eissn: Option<String>,
    pub metric_year: i32,
    pub doc_type: String,
    pub cite_score: Option<f64>,
    pub cite_score_status: Option<String>,
    pub scholarly_output: Option<i32>,
    pub citation_count: Option<i32>,
    pub percent_cited: Option<f64>,
    pub rank: Option<i32>,
    pub percentile: Option<f64>,
    pub quartile: Option<Quartile>,
    pub current_metric: Option<f64>,
    pub current_metric_year: Option<i32>,
    pub tracker: Option<f64>,
    pub tracker_year: Option<i32>,
    pub sjr: Option<f64>,
    pub snip: Option<f64>,
    pub last_fetched_at: DateTime<Utc>,
}

/// Directory entry keyed by its profile URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonProfile {
    pub profile_url: String,
    pub name_th: Option<String>,
    pub name_en: Option<String>,
    pub position: Option<String>,
    pub email: Option<String>,
    pub photo_url: Option<String>,
    pub info: Option<String>,
    pub education: Option<String>,
}

impl PersonProfile {
    /// Field-by-field comparison on trimmed values.
    pub fn same_content(&self, other: &PersonProfile) -> bool {
        fn t(v: &Option<String>) -> &str {
            v.as_deref().map(str::trim).unwrap_or_default()
        }
        self.profile_url.trim() == other.profile_url.trim()
            && t(&self.name_th) == t(&other.name_th)
            && t(&self.name_en) == t(&other.name_en)
            && t(&self.position) == t(&other.position)
            && t(&self.email) == t(&other.email)
            && t(&self.photo_url) == t(&other.photo_url)
            && t(&self.info) == t(&other.info)
            && t(&self.education) == t(&other.education)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileLinkStats {
    pub linked_by_email: usize,
    pub linked_by_profile_url: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScholarPublication {
    pub user_id: i64,
    pub title: String,
    pub authors: Vec<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    pub doi: Option<String>,
    pub url: Option<String>,
    pub cited_by: Option<i32>,
    pub cited_by_url: Option<String>,
    pub cluster_id: Option<String>,
    pub cites_per_year: BTreeMap<String, i64>,
    pub fingerprint: String,
}

/// Ordered identity keys for a scholar publication; the first stored match wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PublicationKey {
    Doi { user_id: i64, doi: String },
    Fingerprint { user_id: i64, fingerprint: String },
}

impl ScholarPublication {
    pub fn candidate_keys(&self) -> Vec<PublicationKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(doi) = non_blank(self.doi.as_deref()) {
            keys.push(PublicationKey::Doi {
                user_id: self.user_id,
                doi: doi.to_ascii_lowercase(),
            });
        }
        keys.push(PublicationKey::Fingerprint {
            user_id: self.user_id,
            fingerprint: self.fingerprint.clone(),
        });
        keys
    }
}

/// SHA-256 over the normalized title and year.
pub fn publication_fingerprint(title: &str, year: Option<i32>) -> String {
    let normalized = normalize_title(title);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b":");
    hasher.update(year.map(|y| y.to_string()).unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScholarAuthorIndices {
    pub h_index: Option<i32>,
    pub h_index_5y: Option<i32>,
    pub i10_index: Option<i32>,
    pub i10_index_5y: Option<i32>,
    pub cited_by_total: Option<i32>,
    pub cited_by_5y: Option<i32>,
    pub cites_per_year: BTreeMap<String, i64>,
}

pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Trims and drops empty strings.
pub fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Truncates to at most `max_chars` characters, ending in `...` when cut.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    if max_chars <= 3 {
        return input.chars().take(max_chars).collect();
    }
    let mut out: String = input.chars().take(max_chars - 3).collect();
    out.push_str("...");
    out
}
