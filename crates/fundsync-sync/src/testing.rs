//! Scripted provider fakes and context builders for job tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fundsync_adapters::{
    CitationSource, DirectoryFetch, DirectorySource, MetricsSource, PageRequest, ScholarEntry,
    ScholarSource, ScriptError, SearchPage, SourceError,
};
use fundsync_core::{
    JournalKey, JournalMetric, ManualClock, PersonProfile, RunDiagnostics, ScholarAuthorIndices,
};
use fundsync_storage::{FetchError, MemoryLock, MemoryStore};
use serde_json::{json, Value};

use crate::jobs::JobContext;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn transport_error(url: &str) -> SourceError {
    SourceError::Fetch(FetchError::HttpStatus {
        status: 503,
        url: url.to_string(),
        body: "unavailable".into(),
        elapsed: Duration::from_millis(5),
    })
}

pub(crate) fn metric(source_id: &str, year: i32, percentile: Option<f64>) -> JournalMetric {
    JournalMetric {
        source_id: source_id.to_string(),
        metric_year: year,
        doc_type: "all".into(),
        percentile,
        quartile: fundsync_core::percentile_to_quartile(percentile),
        last_fetched_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ..Default::default()
    }
}

/// Metrics keyed by the journal's metric identity. Unknown journals have none.
#[derive(Default)]
pub(crate) struct FakeMetrics {
    rows: Mutex<HashMap<String, Vec<JournalMetric>>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl FakeMetrics {
    pub(crate) fn set(&self, identity: &str, rows: Vec<JournalMetric>) {
        lock(&self.rows).insert(identity.to_string(), rows);
    }

    pub(crate) fn fail(&self, identity: &str) {
        lock(&self.failing).insert(identity.to_string());
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn journal_metrics(
        &self,
        journal: &JournalKey,
        _api_key: &str,
    ) -> Result<Vec<JournalMetric>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let identity = journal.metric_identity().unwrap_or_default().to_string();
        if lock(&self.failing).contains(&identity) {
            return Err(transport_error("serial/title"));
        }
        Ok(lock(&self.rows).get(&identity).cloned().unwrap_or_default())
    }
}

/// Search entry that normalizes cleanly.
pub(crate) fn search_entry(eid: &str, source_id: &str) -> Value {
    json!({
        "eid": eid,
        "dc:title": format!("Paper {eid}"),
        "source-id": source_id,
        "prism:issn": "12345678",
        "prism:coverDate": "2023-04-01",
        "affiliation": [{"afid": "60001", "affilname": "KKU"}],
        "author": [{"authid": format!("au-{eid}"), "authname": "Author", "afid": {"$": "60001"}}]
    })
}

/// Serves each author's entries page by page with `total` set to their count.
#[derive(Default)]
pub(crate) struct FakeCitations {
    entries: Mutex<HashMap<String, Vec<Value>>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    later_totals: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<(String, usize)>>,
}

impl FakeCitations {
    pub(crate) fn set(&self, author_id: &str, entries: Vec<Value>) {
        lock(&self.entries).insert(author_id.to_string(), entries);
    }

    pub(crate) fn fail(&self, author_id: &str) {
        lock(&self.failing).insert(author_id.to_string());
    }

    /// Requests for `author_id` never complete.
    pub(crate) fn hang(&self, author_id: &str) {
        lock(&self.hanging).insert(author_id.to_string());
    }

    /// Pages after the first report `total` instead of the real count.
    pub(crate) fn drift_total(&self, author_id: &str, total: usize) {
        lock(&self.later_totals).insert(author_id.to_string(), total);
    }

    pub(crate) fn requests(&self) -> Vec<(String, usize)> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl CitationSource for FakeCitations {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<SearchPage, SourceError> {
        lock(&self.requests).push((request.author_id.to_string(), request.start));
        if lock(&self.hanging).contains(request.author_id) {
            std::future::pending::<()>().await;
        }
        if lock(&self.failing).contains(request.author_id) {
            return Err(transport_error("content/search/scopus"));
        }
        let all = lock(&self.entries)
            .get(request.author_id)
            .cloned()
            .unwrap_or_default();
        let entries = all
            .iter()
            .skip(request.start)
            .take(request.count)
            .cloned()
            .collect();
        let drifted = lock(&self.later_totals).get(request.author_id).copied();
        let total_results = match drifted {
            Some(total) if request.start > 0 => total,
            _ => all.len(),
        };
        Ok(SearchPage {
            total_results,
            entries,
        })
    }
}

pub(crate) fn scholar_entry(title: &str, year: i32, doi: Option<&str>) -> ScholarEntry {
    serde_json::from_value(json!({
        "title": title,
        "year": year,
        "doi": doi,
        "authors": ["A. Author"],
        "num_citations": 3
    }))
    .unwrap()
}

#[derive(Default)]
pub(crate) struct FakeScholar {
    publications: Mutex<HashMap<String, Vec<ScholarEntry>>>,
    indices: Mutex<HashMap<String, ScholarAuthorIndices>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeScholar {
    pub(crate) fn set(&self, author_id: &str, entries: Vec<ScholarEntry>) {
        lock(&self.publications).insert(author_id.to_string(), entries);
    }

    pub(crate) fn set_indices(&self, author_id: &str, indices: ScholarAuthorIndices) {
        lock(&self.indices).insert(author_id.to_string(), indices);
    }

    pub(crate) fn fail(&self, author_id: &str) {
        lock(&self.failing).insert(author_id.to_string());
    }
}

#[async_trait]
impl ScholarSource for FakeScholar {
    async fn publications(&self, author_id: &str) -> Result<Vec<ScholarEntry>, SourceError> {
        if lock(&self.failing).contains(author_id) {
            return Err(ScriptError::Timeout(Duration::from_secs(45)).into());
        }
        Ok(lock(&self.publications)
            .get(author_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn author_indices(&self, author_id: &str) -> Result<ScholarAuthorIndices, SourceError> {
        lock(&self.indices)
            .get(author_id)
            .cloned()
            .ok_or_else(|| SourceError::malformed("indices", "no author indices"))
    }
}

/// One canned directory scrape. A non-zero exit code turns into a script error
/// while the people are still returned.
pub(crate) struct FakeDirectory {
    pub(crate) people: Vec<PersonProfile>,
    pub(crate) exit_code: i32,
    pub(crate) stderr: String,
}

impl FakeDirectory {
    pub(crate) fn new(people: Vec<PersonProfile>) -> Self {
        Self {
            people,
            exit_code: 0,
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl DirectorySource for FakeDirectory {
    async fn fetch_people(&self, _debug: bool) -> DirectoryFetch {
        let stdout = serde_json::to_string(&self.people).unwrap();
        let error = (self.exit_code != 0).then(|| {
            SourceError::Script(ScriptError::Exit {
                exit_code: Some(self.exit_code),
                stdout: stdout.clone(),
                stderr: self.stderr.clone(),
            })
        });
        DirectoryFetch {
            people: self.people.clone(),
            diagnostics: RunDiagnostics {
                stdout: Some(stdout),
                stderr: Some(self.stderr.clone()),
                exit_code: Some(self.exit_code),
            },
            error,
        }
    }
}

pub(crate) fn person(url: &str, email: Option<&str>) -> PersonProfile {
    PersonProfile {
        profile_url: url.to_string(),
        name_en: Some(format!("Person {url}")),
        email: email.map(str::to_string),
        ..Default::default()
    }
}

/// Context over a memory store with an API key configured.
pub(crate) fn context(store: &MemoryStore, locks: &MemoryLock) -> JobContext {
    store.set_config("X-ELS-APIKey", "test-key-1234");
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap(),
    ));
    JobContext::new(
        Arc::new(store.clone()),
        Arc::new(locks.clone()),
        clock,
        chrono::Duration::minutes(5),
    )
}
