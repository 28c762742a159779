use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use fundsync_core::coerce::{one_or_many, TextValue};
use fundsync_core::{clean, publication_fingerprint, ScholarAuthorIndices, ScholarPublication};
use serde::Deserialize;
use tracing::debug;

use crate::script::{decode_json_output, run_script, ScriptCommand};
use crate::{ScholarSource, SourceError};

pub const DEFAULT_SCHOLAR_SCRIPT: &str = "scripts/scholarly_fetch.py";
pub const DEFAULT_INDICES_SCRIPT: &str = "scripts/scholar_author_indices.py";
pub const SCHOLAR_TIMEOUT: Duration = Duration::from_secs(45);

/// One publication as printed by the scholar fetch script.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScholarEntry {
    pub title: TextValue,
    #[serde(deserialize_with = "one_or_many")]
    pub authors: Vec<String>,
    pub venue: TextValue,
    pub year: TextValue,
    pub url: TextValue,
    pub doi: TextValue,
    pub scholar_cluster_id: TextValue,
    pub num_citations: TextValue,
    pub citedby_url: TextValue,
    pub cites_per_year: BTreeMap<String, i64>,
}

impl ScholarEntry {
    /// `None` when the entry has no title to identify it by.
    pub fn into_publication(self, user_id: i64) -> Option<ScholarPublication> {
        let title = self.title.into_inner()?;
        let year = self.year.parse::<i32>();
        let fingerprint = publication_fingerprint(&title, year);
        Some(ScholarPublication {
            user_id,
            authors: self
                .authors
                .into_iter()
                .filter_map(|a| clean(Some(a)))
                .collect(),
            venue: self.venue.into_inner(),
            year,
            doi: self.doi.into_inner(),
            url: self.url.into_inner(),
            cited_by: self.num_citations.parse(),
            cited_by_url: self.citedby_url.into_inner(),
            cluster_id: self.scholar_cluster_id.into_inner(),
            cites_per_year: self.cites_per_year,
            fingerprint,
            title,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IndicesOutput {
    hindex: TextValue,
    hindex5y: TextValue,
    i10index: TextValue,
    i10index5y: TextValue,
    citedby_total: TextValue,
    citedby_5y: TextValue,
    cites_per_year: BTreeMap<String, i64>,
}

impl From<IndicesOutput> for ScholarAuthorIndices {
    fn from(out: IndicesOutput) -> Self {
        ScholarAuthorIndices {
            h_index: out.hindex.parse(),
            h_index_5y: out.hindex5y.parse(),
            i10_index: out.i10index.parse(),
            i10_index_5y: out.i10index5y.parse(),
            cited_by_total: out.citedby_total.parse(),
            cited_by_5y: out.citedby_5y.parse(),
            cites_per_year: out.cites_per_year,
        }
    }
}

pub fn parse_publications(stdout: &str) -> Result<Vec<ScholarEntry>, SourceError> {
    Ok(decode_json_output(stdout)?)
}

pub fn parse_indices(stdout: &str) -> Result<ScholarAuthorIndices, SourceError> {
    let out: IndicesOutput = decode_json_output(stdout)?;
    Ok(out.into())
}

/// Scholar profile fetches backed by two python scripts.
#[derive(Debug, Clone)]
pub struct ScholarScripts {
    pub python: String,
    pub publications_script: String,
    pub indices_script: String,
    pub timeout: Duration,
}

impl ScholarScripts {
    pub fn new(python: impl Into<String>, publications_script: impl Into<String>, indices_script: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            publications_script: publications_script.into(),
            indices_script: indices_script.into(),
            timeout: SCHOLAR_TIMEOUT,
        }
    }

    async fn run(&self, script: &str, author_id: &str) -> Result<String, SourceError> {
        let command = ScriptCommand::new(&self.python, self.timeout)
            .arg(script)
            .arg(author_id);
        let output = run_script(&command).await?;
        if let Some(err) = output.exit_error() {
            return Err(err.into());
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ScholarSource for ScholarScripts {
    async fn publications(&self, author_id: &str) -> Result<Vec<ScholarEntry>, SourceError> {
        let stdout = self.run(&self.publications_script, author_id).await?;
        let entries = parse_publications(&stdout)?;
        debug!(author_id, count = entries.len(), "scholar publications fetched");
        Ok(entries)
    }

    async fn author_indices(&self, author_id: &str) -> Result<ScholarAuthorIndices, SourceError> {
        let stdout = self.run(&self.indices_script, author_id).await?;
        parse_indices(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptError;
    use std::io::Write;

    #[test]
    fn entries_become_publications() {
        let entries = parse_publications(
            r#"[
                {"title": "  Deep   Rice ", "authors": ["A", " ", "B"], "year": 2020,
                 "doi": "10.1/ABC", "num_citations": 4, "cites_per_year": {"2021": 3}},
                {"title": "", "authors": "Solo"},
                {"title": "Single author", "authors": "Solo", "year": "n/a"}
            ]"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 3);

        let pubs: Vec<_> = entries
            .into_iter()
            .filter_map(|e| e.into_publication(7))
            .collect();
        assert_eq!(pubs.len(), 2);
        assert_eq!(pubs[0].title, "Deep   Rice");
        assert_eq!(pubs[0].authors, vec!["A", "B"]);
        assert_eq!(pubs[0].year, Some(2020));
        assert_eq!(pubs[0].cited_by, Some(4));
        assert_eq!(pubs[0].cites_per_year.get("2021"), Some(&3));
        assert_eq!(pubs[0].fingerprint, publication_fingerprint("deep rice", Some(2020)));
        assert_eq!(pubs[1].authors, vec!["Solo"]);
        assert_eq!(pubs[1].year, None);
    }

    #[test]
    fn indices_accept_missing_fields() {
        let indices = parse_indices(r#"{"hindex": 12, "i10index": "15", "cites_per_year": {"2022": 40}}"#)
            .unwrap();
        assert_eq!(indices.h_index, Some(12));
        assert_eq!(indices.i10_index, Some(15));
        assert_eq!(indices.h_index_5y, None);
        assert_eq!(indices.cites_per_year.get("2022"), Some(&40));
    }

    #[tokio::test]
    async fn script_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fail.py");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "echo quota >&2; exit 1").unwrap();

        let scripts = ScholarScripts::new("sh", path.display().to_string(), path.display().to_string());
        let err = scripts.publications("abc").await.unwrap_err();
        match err {
            SourceError::Script(ScriptError::Exit { exit_code, stderr, .. }) => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr.trim(), "quota");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn script_receives_author_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"printf '[{{"title": "%s"}}]' "$1""#).unwrap();

        let scripts = ScholarScripts::new("sh", path.display().to_string(), path.display().to_string());
        let entries = scripts.publications("author-9").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title.as_deref(), Some("author-9"));
    }
}
