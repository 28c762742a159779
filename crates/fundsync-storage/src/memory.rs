//! In-process store and lock for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fundsync_core::{
    AffiliationRecord, AuthorRecord, DocumentAuthorLink, DocumentRecord, JobFamily, JobRun,
    JournalKey, JournalMetric, JournalTarget, MetricMatch, NewJobRun, PersonProfile, ProfileLinkStats,
    PublicationKey, RunCompletion, RunStatus, ScholarAuthorIndices, ScholarPublication, Subject,
    SubjectFilter,
};

use crate::lock::{HeldLock, LockGuard, LockManager};
use crate::store::*;
use crate::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryUser {
    pub user_id: i64,
    pub email: Option<String>,
    pub scopus_id: Option<String>,
    pub scholar_author_id: Option<String>,
    pub cp_web_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryImportJob {
    pub id: i64,
    pub job: NewImportJob,
    pub total_results: Option<i64>,
    pub status: Option<ImportJobStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct DocumentTables {
    next_id: i64,
    documents: BTreeMap<i64, DocumentRecord>,
    affiliations: BTreeMap<i64, AffiliationRecord>,
    authors: BTreeMap<i64, AuthorRecord>,
    links: BTreeMap<i64, DocumentAuthorLink>,
}

impl DocumentTables {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
struct State {
    tables: DocumentTables,
    runs: Vec<JobRun>,
    config: HashMap<String, String>,
    import_jobs: Vec<MemoryImportJob>,
    api_requests: Vec<ApiRequestRecord>,
    users: Vec<MemoryUser>,
    metrics: Vec<JournalMetric>,
    publications: BTreeMap<i64, ScholarPublication>,
    author_indices: HashMap<i64, ScholarAuthorIndices>,
    profiles: BTreeMap<String, (PersonProfile, Option<i64>)>,
    next_id: i64,
    entity_writes: usize,
    failing_eids: HashSet<String>,
}

impl State {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared-state store; clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_config(&self, key: &str, value: &str) {
        self.state().config.insert(key.to_string(), value.to_string());
    }

    pub fn add_user(&self, user: MemoryUser) {
        let mut state = self.state();
        state.users.push(user);
        state.users.sort_by_key(|u| u.user_id);
    }

    /// Makes every upsert of the document with `eid` fail.
    pub fn fail_document(&self, eid: &str) {
        self.state().failing_eids.insert(eid.to_string());
    }

    /// Entity-table writes that were committed.
    pub fn entity_writes(&self) -> usize {
        self.state().entity_writes
    }

    pub fn runs(&self) -> Vec<JobRun> {
        self.state().runs.clone()
    }

    pub fn documents(&self) -> Vec<DocumentRecord> {
        self.state().tables.documents.values().cloned().collect()
    }

    pub fn authors(&self) -> Vec<AuthorRecord> {
        self.state().tables.authors.values().cloned().collect()
    }

    pub fn affiliations(&self) -> Vec<AffiliationRecord> {
        self.state().tables.affiliations.values().cloned().collect()
    }

    pub fn links(&self) -> Vec<DocumentAuthorLink> {
        self.state().tables.links.values().copied().collect()
    }

    pub fn metrics(&self) -> Vec<JournalMetric> {
        self.state().metrics.clone()
    }

    pub fn import_jobs(&self) -> Vec<MemoryImportJob> {
        self.state().import_jobs.clone()
    }

    pub fn api_requests(&self) -> Vec<ApiRequestRecord> {
        self.state().api_requests.clone()
    }

    pub fn publications(&self) -> Vec<ScholarPublication> {
        self.state().publications.values().cloned().collect()
    }

    pub fn author_indices(&self, user_id: i64) -> Option<ScholarAuthorIndices> {
        self.state().author_indices.get(&user_id).cloned()
    }

    pub fn profiles(&self) -> Vec<PersonProfile> {
        self.state()
            .profiles
            .values()
            .map(|(profile, _)| profile.clone())
            .collect()
    }

    pub fn profile_user(&self, profile_url: &str) -> Option<i64> {
        self.state()
            .profiles
            .get(profile_url)
            .and_then(|(_, user_id)| *user_id)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: &NewJobRun) -> Result<(), StoreError> {
        self.state().runs.push(JobRun {
            id: run.id,
            job_family: run.job_family,
            trigger_source: run.trigger_source.clone(),
            dry_run: run.dry_run,
            status: RunStatus::Running,
            started_at: run.started_at,
            finished_at: None,
            duration_ms: None,
            error_message: None,
            summary: None,
            stdout: None,
            stderr: None,
            exit_code: None,
            requested_subject_ids: run.requested_subject_ids.clone(),
            subject_limit: run.subject_limit,
        });
        Ok(())
    }

    async fn complete_run(
        &self,
        id: uuid::Uuid,
        completion: &RunCompletion,
    ) -> Result<bool, StoreError> {
        let mut state = self.state();
        let Some(run) = state
            .runs
            .iter_mut()
            .find(|r| r.id == id && r.status == RunStatus::Running)
        else {
            return Ok(false);
        };
        run.status = completion.status;
        run.finished_at = Some(completion.finished_at);
        run.duration_ms = Some(completion.duration_ms);
        run.summary = completion.summary.clone();
        run.stdout = completion.stdout.clone();
        run.stderr = completion.stderr.clone();
        run.exit_code = completion.exit_code;
        run.error_message = completion.error_message.clone();
        Ok(true)
    }

    async fn run_by_id(&self, id: uuid::Uuid) -> Result<Option<JobRun>, StoreError> {
        Ok(self.state().runs.iter().find(|r| r.id == id).cloned())
    }

    async fn latest_completed_run(&self, family: JobFamily) -> Result<Option<JobRun>, StoreError> {
        Ok(self
            .state()
            .runs
            .iter()
            .filter(|r| r.job_family == family && r.status != RunStatus::Running)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn running_run(&self, family: JobFamily) -> Result<Option<JobRun>, StoreError> {
        Ok(self
            .state()
            .runs
            .iter()
            .filter(|r| r.job_family == family && r.status == RunStatus::Running)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn list_runs(
        &self,
        family: JobFamily,
        limit: i64,
        offset: i64,
    ) -> Result<RunPage, StoreError> {
        let state = self.state();
        let mut runs: Vec<JobRun> = state
            .runs
            .iter()
            .filter(|r| r.job_family == family)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = runs.len() as i64;
        let runs = runs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(RunPage { runs, total })
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn config_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state().config.get(key).cloned())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn open_import_job(&self, job: &NewImportJob) -> Result<i64, StoreError> {
        let mut state = self.state();
        let id = state.allocate();
        state.import_jobs.push(MemoryImportJob {
            id,
            job: job.clone(),
            total_results: None,
            status: None,
            error: None,
        });
        Ok(id)
    }

    async fn set_import_job_total(&self, id: i64, total_results: i64) -> Result<(), StoreError> {
        if let Some(job) = self.state().import_jobs.iter_mut().find(|j| j.id == id) {
            job.total_results = Some(total_results);
        }
        Ok(())
    }

    async fn close_import_job(
        &self,
        id: i64,
        status: ImportJobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(job) = self.state().import_jobs.iter_mut().find(|j| j.id == id) {
            job.status = Some(status);
            job.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn record_api_request(&self, record: &ApiRequestRecord) -> Result<(), StoreError> {
        self.state().api_requests.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl SubjectStore for MemoryStore {
    async fn eligible_subjects(
        &self,
        family: JobFamily,
        filter: &SubjectFilter,
    ) -> Result<Vec<Subject>, StoreError> {
        let state = self.state();
        let subjects = state
            .users
            .iter()
            .filter(|u| filter.user_ids.is_empty() || filter.user_ids.contains(&u.user_id))
            .filter_map(|u| {
                let external = match family {
                    JobFamily::CitationIndex => u.scopus_id.as_deref(),
                    JobFamily::ScholarProfile => u.scholar_author_id.as_deref(),
                    _ => None,
                };
                let external = external.map(str::trim).filter(|v| !v.is_empty())?;
                Some(Subject {
                    user_id: u.user_id,
                    external_id: external.to_string(),
                })
            });
        Ok(match filter.limit.filter(|l| *l > 0) {
            Some(limit) => subjects.take(limit as usize).collect(),
            None => subjects.collect(),
        })
    }
}

struct MemoryDocumentTx {
    state: Arc<Mutex<State>>,
    tables: DocumentTables,
    failing_eids: HashSet<String>,
    writes: usize,
}

#[async_trait]
impl DocumentTx for MemoryDocumentTx {
    async fn document_id(&mut self, eid: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .tables
            .documents
            .iter()
            .find(|(_, d)| d.eid == eid)
            .map(|(id, _)| *id))
    }

    async fn upsert_document(&mut self, doc: &DocumentRecord) -> Result<Upserted, StoreError> {
        if self.failing_eids.contains(&doc.eid) {
            return Err(StoreError::message(format!("write rejected for {}", doc.eid)));
        }
        self.writes += 1;
        match self.document_id(&doc.eid).await? {
            Some(id) => {
                self.tables.documents.insert(id, doc.clone());
                Ok(Upserted { id, created: false })
            }
            None => {
                let id = self.tables.allocate();
                self.tables.documents.insert(id, doc.clone());
                Ok(Upserted { id, created: true })
            }
        }
    }

    async fn affiliation_id(&mut self, afid: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .tables
            .affiliations
            .iter()
            .find(|(_, a)| a.afid == afid)
            .map(|(id, _)| *id))
    }

    async fn upsert_affiliation(
        &mut self,
        affiliation: &AffiliationRecord,
    ) -> Result<Upserted, StoreError> {
        self.writes += 1;
        match self.affiliation_id(&affiliation.afid).await? {
            Some(id) => {
                self.tables.affiliations.insert(id, affiliation.clone());
                Ok(Upserted { id, created: false })
            }
            None => {
                let id = self.tables.allocate();
                self.tables.affiliations.insert(id, affiliation.clone());
                Ok(Upserted { id, created: true })
            }
        }
    }

    async fn author_id(&mut self, external_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .tables
            .authors
            .iter()
            .find(|(_, a)| a.author_id == external_id)
            .map(|(id, _)| *id))
    }

    async fn upsert_author(&mut self, author: &AuthorRecord) -> Result<Upserted, StoreError> {
        self.writes += 1;
        match self.author_id(&author.author_id).await? {
            Some(id) => {
                let mut incoming = author.clone();
                let incoming_blank = incoming
                    .orcid
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or_default()
                    .is_empty();
                if incoming_blank {
                    incoming.orcid = self.tables.authors.get(&id).and_then(|a| a.orcid.clone());
                }
                self.tables.authors.insert(id, incoming);
                Ok(Upserted { id, created: false })
            }
            None => {
                let id = self.tables.allocate();
                self.tables.authors.insert(id, author.clone());
                Ok(Upserted { id, created: true })
            }
        }
    }

    async fn link_exists(&mut self, document_id: i64, author_id: i64) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .links
            .values()
            .any(|l| l.document_id == document_id && l.author_id == author_id))
    }

    async fn upsert_link(&mut self, link: &DocumentAuthorLink) -> Result<Upserted, StoreError> {
        self.writes += 1;
        let existing = self
            .tables
            .links
            .iter()
            .find(|(_, l)| l.document_id == link.document_id && l.author_id == link.author_id)
            .map(|(id, _)| *id);
        match existing {
            Some(id) => {
                self.tables.links.insert(id, *link);
                Ok(Upserted { id, created: false })
            }
            None => {
                let id = self.tables.allocate();
                self.tables.links.insert(id, *link);
                Ok(Upserted { id, created: true })
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut state = this
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.tables = this.tables;
        state.entity_writes += this.writes;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn begin_document(&self) -> Result<Box<dyn DocumentTx>, StoreError> {
        let (tables, failing_eids) = {
            let state = self.state();
            (state.tables.clone(), state.failing_eids.clone())
        };
        Ok(Box::new(MemoryDocumentTx {
            state: Arc::clone(&self.state),
            tables,
            failing_eids,
            writes: 0,
        }))
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn metric_exists(
        &self,
        journal: &JournalKey,
        year: Option<i32>,
    ) -> Result<bool, StoreError> {
        let Some(by) = journal.metric_match() else {
            return Ok(false);
        };
        Ok(self.state().metrics.iter().any(|m| {
            let same_journal = match by {
                MetricMatch::SourceId(source_id) => m.source_id == source_id,
                MetricMatch::Issn(issn) => m.issn.as_deref() == Some(issn),
            };
            same_journal && year.map_or(true, |y| m.metric_year == y)
        }))
    }

    async fn upsert_metric(&self, metric: &JournalMetric) -> Result<Upserted, StoreError> {
        let mut state = self.state();
        state.entity_writes += 1;
        let position = state.metrics.iter().position(|m| {
            m.source_id == metric.source_id
                && m.metric_year == metric.metric_year
                && m.doc_type == metric.doc_type
        });
        match position {
            Some(idx) => {
                state.metrics[idx] = metric.clone();
                Ok(Upserted {
                    id: idx as i64 + 1,
                    created: false,
                })
            }
            None => {
                state.metrics.push(metric.clone());
                Ok(Upserted {
                    id: state.metrics.len() as i64,
                    created: true,
                })
            }
        }
    }

    async fn journal_targets(&self) -> Result<Vec<JournalTarget>, StoreError> {
        let state = self.state();
        let mut targets: BTreeMap<(String, String), JournalTarget> = BTreeMap::new();
        for doc in state.tables.documents.values() {
            let key = JournalKey {
                issn: fundsync_core::clean(doc.issn.clone()),
                source_id: fundsync_core::clean(doc.source_id.clone()),
            };
            if key.issn.is_none() && key.source_id.is_none() {
                continue;
            }
            let sort_key = (
                key.source_id.clone().unwrap_or_default(),
                key.issn.clone().unwrap_or_default(),
            );
            let entry = targets.entry(sort_key).or_insert_with(|| JournalTarget {
                key,
                latest_cover_date: None,
            });
            if doc.cover_date > entry.latest_cover_date {
                entry.latest_cover_date = doc.cover_date;
            }
        }
        Ok(targets.into_values().collect())
    }
}

#[async_trait]
impl PublicationStore for MemoryStore {
    async fn find_publication(&self, key: &PublicationKey) -> Result<Option<i64>, StoreError> {
        let state = self.state();
        Ok(state
            .publications
            .iter()
            .find(|(_, p)| match key {
                PublicationKey::Doi { user_id, doi } => {
                    p.user_id == *user_id
                        && p.doi.as_deref().map(|d| d.trim().to_ascii_lowercase())
                            == Some(doi.clone())
                }
                PublicationKey::Fingerprint {
                    user_id,
                    fingerprint,
                } => p.user_id == *user_id && &p.fingerprint == fingerprint,
            })
            .map(|(id, _)| *id))
    }

    async fn insert_publication(&self, publication: &ScholarPublication) -> Result<i64, StoreError> {
        let mut state = self.state();
        let id = state.allocate();
        state.publications.insert(id, publication.clone());
        state.entity_writes += 1;
        Ok(id)
    }

    async fn update_publication(
        &self,
        id: i64,
        publication: &ScholarPublication,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        state.publications.insert(id, publication.clone());
        state.entity_writes += 1;
        Ok(())
    }

    async fn upsert_author_indices(
        &self,
        user_id: i64,
        indices: &ScholarAuthorIndices,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        state.author_indices.insert(user_id, indices.clone());
        state.entity_writes += 1;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn profiles_by_url(&self, urls: &[String]) -> Result<Vec<PersonProfile>, StoreError> {
        let state = self.state();
        Ok(urls
            .iter()
            .filter_map(|url| state.profiles.get(url).map(|(p, _)| p.clone()))
            .collect())
    }

    async fn upsert_profile(&self, profile: &PersonProfile) -> Result<Upserted, StoreError> {
        let mut state = self.state();
        state.entity_writes += 1;
        let created = !state.profiles.contains_key(&profile.profile_url);
        let user_id = state
            .profiles
            .get(&profile.profile_url)
            .and_then(|(_, user_id)| *user_id);
        state
            .profiles
            .insert(profile.profile_url.clone(), (profile.clone(), user_id));
        let id = state
            .profiles
            .keys()
            .position(|k| k == &profile.profile_url)
            .map_or(0, |p| p as i64 + 1);
        Ok(Upserted { id, created })
    }

    async fn link_profiles_to_users(&self) -> Result<ProfileLinkStats, StoreError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let mut stats = ProfileLinkStats::default();

        for (profile, user_id) in state.profiles.values_mut() {
            if user_id.is_some() {
                continue;
            }
            let email = profile
                .email
                .as_deref()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty());
            let Some(email) = email else { continue };
            if let Some(user) = state.users.iter().find(|u| {
                u.email.as_deref().map(|e| e.trim().to_lowercase()) == Some(email.clone())
            }) {
                *user_id = Some(user.user_id);
                stats.linked_by_email += 1;
            }
        }

        for (profile, user_id) in state.profiles.values_mut() {
            if user_id.is_some() {
                continue;
            }
            let normalized = normalize_profile_ref(&profile.profile_url);
            if normalized.is_empty() {
                continue;
            }
            if let Some(user) = state.users.iter().find(|u| {
                u.cp_web_id.as_deref().map(normalize_profile_ref) == Some(normalized.clone())
            }) {
                *user_id = Some(user.user_id);
                stats.linked_by_profile_url += 1;
            }
        }

        state.entity_writes += stats.linked_by_email + stats.linked_by_profile_url;
        Ok(stats)
    }
}

/// Process-local lock table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLock {
    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name)
    }
}

#[async_trait]
impl LockManager for MemoryLock {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, StoreError> {
        let inserted = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());
        if !inserted {
            return Ok(None);
        }
        Ok(Some(LockGuard::new(
            name,
            Box::new(MemoryHeldLock {
                name: name.to_string(),
                held: Arc::clone(&self.held),
            }),
        )))
    }
}

struct MemoryHeldLock {
    name: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for MemoryHeldLock {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
    }
}

#[async_trait]
impl HeldLock for MemoryHeldLock {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        drop(self);
        Ok(())
    }
}
