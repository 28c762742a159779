//! Fetch capabilities for the external providers: citation index and journal
//! metrics over REST, scholar profiles and the personnel directory via scripts.

use async_trait::async_trait;
use fundsync_core::{JournalKey, JournalMetric, PersonProfile, RunDiagnostics, ScholarAuthorIndices};
use fundsync_storage::FetchError;
use thiserror::Error;

pub mod citescore;
pub mod directory;
pub mod scholar;
pub mod scopus;
pub mod script;

pub use citescore::CiteScoreClient;
pub use directory::PeopleDirectoryScript;
pub use scholar::{ScholarEntry, ScholarScripts};
pub use scopus::{NormalizedAuthor, NormalizedEntry, PageRequest, ScopusSearchClient, SearchPage};
pub use script::{ScriptCommand, ScriptError, ScriptOutput};

pub const CRATE_NAME: &str = "fundsync-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {what} payload: {message}")]
    Malformed { what: &'static str, message: String },
    #[error(transparent)]
    Script(#[from] ScriptError),
}

impl SourceError {
    pub fn malformed(what: &'static str, message: impl Into<String>) -> Self {
        SourceError::Malformed {
            what,
            message: message.into(),
        }
    }
}

/// Author-scoped document search, one page per call.
#[async_trait]
pub trait CitationSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<SearchPage, SourceError>;
}

/// Journal-level citation metrics. An empty list means the provider has none.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn journal_metrics(
        &self,
        journal: &JournalKey,
        api_key: &str,
    ) -> Result<Vec<JournalMetric>, SourceError>;
}

#[async_trait]
pub trait ScholarSource: Send + Sync {
    async fn publications(&self, author_id: &str) -> Result<Vec<ScholarEntry>, SourceError>;
    async fn author_indices(&self, author_id: &str) -> Result<ScholarAuthorIndices, SourceError>;
}

/// Result of one directory scrape. `error` is set when the scrape failed, in
/// which case `people` holds whatever could still be parsed.
#[derive(Debug, Default)]
pub struct DirectoryFetch {
    pub people: Vec<PersonProfile>,
    pub diagnostics: RunDiagnostics,
    pub error: Option<SourceError>,
}

#[async_trait]
pub trait DirectorySource: Send + Sync {
    async fn fetch_people(&self, debug: bool) -> DirectoryFetch;
}
