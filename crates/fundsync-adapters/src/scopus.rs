//! Citation-index search client and entry normalization.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use fundsync_core::coerce::{one_or_many, TextValue};
use fundsync_core::{AffiliationRecord, AuthorRecord, DocumentRecord};
use fundsync_storage::{ApiRequestRecord, AuditStore, HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{CitationSource, SourceError};

pub const DEFAULT_SEARCH_URL: &str = "https://api.elsevier.com/content/search/scopus";
pub const PAGE_SIZE: usize = 25;
pub const API_KEY_HEADER: &str = "X-ELS-APIKey";
/// Config keys checked for the API key, in order.
pub const API_KEY_CONFIG_KEYS: [&str; 2] = [API_KEY_HEADER, "api_key"];
pub const SERVICE: &str = "scopus";

#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest<'a> {
    pub author_id: &'a str,
    pub start: usize,
    pub count: usize,
    pub api_key: &'a str,
    pub import_job_id: Option<i64>,
    /// Write the request to the audit trail.
    pub record: bool,
}

impl PageRequest<'_> {
    pub fn query(&self) -> String {
        format!("AU-ID({})", self.author_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub total_results: usize,
    pub entries: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(rename = "search-results")]
    results: SearchResults,
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    #[serde(rename = "opensearch:totalResults", default)]
    total_results: TextValue,
    #[serde(default, deserialize_with = "one_or_many")]
    entry: Vec<Value>,
}

pub fn parse_search_page(body: &[u8]) -> Result<SearchPage, SourceError> {
    let envelope: SearchEnvelope = serde_json::from_slice(body)
        .map_err(|err| SourceError::malformed("search", err.to_string()))?;
    let total_results = envelope.results.total_results.parse::<usize>().unwrap_or(0);
    // An empty result set comes back as a single `{"error": ...}` entry.
    let entries = envelope
        .results
        .entry
        .into_iter()
        .filter(|entry| entry.get("error").is_none())
        .collect();
    Ok(SearchPage {
        total_results,
        entries,
    })
}

pub fn search_request(base_url: &str, request: &PageRequest<'_>) -> HttpRequest {
    HttpRequest::get(base_url)
        .query("query", request.query())
        .query("count", request.count.to_string())
        .query("start", request.start.to_string())
        .query("view", "COMPLETE")
        .header("Accept", "application/json")
        .header(API_KEY_HEADER, request.api_key)
}

/// Header map for the audit trail with credentials masked.
pub fn redacted_headers(request: &HttpRequest) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in &request.headers {
        let shown = if key.eq_ignore_ascii_case(API_KEY_HEADER) {
            mask_secret(value)
        } else {
            value.clone()
        };
        map.insert(key.clone(), Value::String(shown));
    }
    Value::Object(map)
}

fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

fn endpoint_path(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

pub struct ScopusSearchClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    audit: Arc<dyn AuditStore>,
}

impl ScopusSearchClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, audit: Arc<dyn AuditStore>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            audit,
        }
    }

    async fn record(&self, record: ApiRequestRecord) {
        if let Err(err) = self.audit.record_api_request(&record).await {
            warn!(error = %err, endpoint = %record.endpoint, "failed to record api request");
        }
    }
}

#[async_trait]
impl CitationSource for ScopusSearchClient {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<SearchPage, SourceError> {
        let http_request = search_request(&self.base_url, request);
        let requested_at = Utc::now();
        let started = std::time::Instant::now();

        let outcome = self.http.get(SERVICE, &http_request).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let (status, parsed) = match outcome {
            Ok(response) => (
                Some(i32::from(response.status.as_u16())),
                parse_search_page(&response.body),
            ),
            Err(err) => (err.status().map(i32::from), Err(SourceError::from(err))),
        };

        debug!(
            author_id = request.author_id,
            start = request.start,
            status = ?status,
            elapsed_ms,
            "search page fetched"
        );

        if request.record {
            let query_params: serde_json::Map<String, Value> = http_request
                .query
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            self.record(ApiRequestRecord {
                import_job_id: request.import_job_id,
                service: SERVICE.to_string(),
                http_method: "GET".to_string(),
                endpoint: endpoint_path(&self.base_url),
                query_params: Value::Object(query_params),
                request_headers: redacted_headers(&http_request),
                response_status: status,
                response_time_ms: elapsed_ms,
                page_start: Some(request.start as i32),
                page_count: Some(request.count as i32),
                items_returned: parsed.as_ref().ok().map(|p| p.entries.len() as i32),
                error_message: parsed.as_ref().err().map(|e| e.to_string()),
                requested_at,
            })
            .await;
        }

        parsed
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScopusEntry {
    eid: TextValue,
    #[serde(rename = "dc:identifier")]
    identifier: TextValue,
    #[serde(rename = "prism:url")]
    prism_url: TextValue,
    #[serde(rename = "dc:title")]
    title: TextValue,
    #[serde(rename = "dc:description")]
    description: TextValue,
    #[serde(rename = "prism:aggregationType")]
    aggregation_type: TextValue,
    subtype: TextValue,
    #[serde(rename = "subtypeDescription")]
    subtype_description: TextValue,
    #[serde(rename = "source-id")]
    source_id: TextValue,
    #[serde(rename = "prism:publicationName")]
    publication_name: TextValue,
    #[serde(rename = "prism:issn")]
    issn: TextValue,
    #[serde(rename = "prism:eIssn")]
    eissn: TextValue,
    #[serde(rename = "prism:isbn")]
    isbn: TextValue,
    #[serde(rename = "prism:volume")]
    volume: TextValue,
    #[serde(rename = "prism:issueIdentifier")]
    issue: TextValue,
    #[serde(rename = "prism:pageRange")]
    page_range: TextValue,
    #[serde(rename = "article-number")]
    article_number: TextValue,
    #[serde(rename = "prism:coverDate")]
    cover_date: TextValue,
    #[serde(rename = "prism:coverDisplayDate")]
    cover_display_date: TextValue,
    #[serde(rename = "prism:doi")]
    doi: TextValue,
    pii: TextValue,
    #[serde(rename = "citedby-count")]
    citedby_count: TextValue,
    openaccess: TextValue,
    #[serde(rename = "openaccessFlag")]
    openaccess_flag: TextValue,
    authkeywords: TextValue,
    #[serde(rename = "fund-acr")]
    fund_acronym: TextValue,
    #[serde(rename = "fund-sponsor")]
    fund_sponsor: TextValue,
    #[serde(deserialize_with = "one_or_many")]
    link: Vec<EntryLink>,
    #[serde(deserialize_with = "one_or_many")]
    affiliation: Vec<EntryAffiliation>,
    #[serde(deserialize_with = "one_or_many")]
    author: Vec<EntryAuthor>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EntryLink {
    #[serde(rename = "@ref")]
    rel: TextValue,
    #[serde(rename = "@href")]
    href: TextValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EntryAffiliation {
    afid: TextValue,
    affilname: TextValue,
    #[serde(rename = "affiliation-city")]
    city: TextValue,
    #[serde(rename = "affiliation-country")]
    country: TextValue,
    #[serde(rename = "affiliation-url")]
    url: TextValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EntryAuthor {
    authid: TextValue,
    authname: TextValue,
    #[serde(rename = "given-name")]
    given_name: TextValue,
    surname: TextValue,
    initials: TextValue,
    orcid: TextValue,
    #[serde(rename = "author-url")]
    author_url: TextValue,
    #[serde(deserialize_with = "one_or_many")]
    afid: Vec<TextValue>,
}

/// An author of a document with their list position and first affiliation id.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAuthor {
    pub record: AuthorRecord,
    pub seq: i32,
    pub first_afid: Option<String>,
}

/// One search entry split into the rows it feeds.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    pub document: DocumentRecord,
    pub affiliations: Vec<AffiliationRecord>,
    pub authors: Vec<NormalizedAuthor>,
    pub skipped_authors: usize,
    pub skipped_affiliations: usize,
}

pub fn normalize_entry(raw: &Value) -> Result<NormalizedEntry, SourceError> {
    let entry = ScopusEntry::deserialize(raw)
        .map_err(|err| SourceError::malformed("entry", err.to_string()))?;
    let eid = entry
        .eid
        .clone()
        .into_inner()
        .ok_or_else(|| SourceError::malformed("entry", "missing eid"))?;

    let mut skipped_affiliations = 0;
    let affiliations = entry
        .affiliation
        .iter()
        .filter_map(|aff| match aff.afid.as_deref() {
            Some(afid) => Some(AffiliationRecord {
                afid: afid.to_string(),
                name: aff.affilname.0.clone(),
                city: aff.city.0.clone(),
                country: aff.country.0.clone(),
                url: aff.url.0.clone(),
            }),
            None => {
                skipped_affiliations += 1;
                None
            }
        })
        .collect();

    let mut skipped_authors = 0;
    let authors = entry
        .author
        .iter()
        .enumerate()
        .filter_map(|(idx, author)| {
            let Some(author_id) = author.authid.as_deref() else {
                skipped_authors += 1;
                return None;
            };
            Some(NormalizedAuthor {
                record: AuthorRecord {
                    author_id: author_id.to_string(),
                    full_name: author.authname.0.clone(),
                    given_name: author.given_name.0.clone(),
                    surname: author.surname.0.clone(),
                    initials: author.initials.0.clone(),
                    orcid: author.orcid.0.clone(),
                    author_url: author.author_url.0.clone(),
                },
                seq: idx as i32 + 1,
                first_afid: author.afid.iter().find_map(|a| a.0.clone()),
            })
        })
        .collect();

    let document = DocumentRecord {
        eid,
        scopus_id: entry
            .identifier
            .as_deref()
            .map(|id| id.trim_start_matches("SCOPUS_ID:").to_string()),
        scopus_link: select_link(&entry),
        title: entry.title.0.clone(),
        abstract_text: entry.description.0.clone(),
        aggregation_type: entry.aggregation_type.0.clone(),
        subtype: entry.subtype.0.clone(),
        subtype_description: entry.subtype_description.0.clone(),
        source_id: entry.source_id.0.clone(),
        publication_name: entry.publication_name.0.clone(),
        issn: entry.issn.0.clone(),
        eissn: entry.eissn.0.clone(),
        isbn: entry.isbn.0.clone(),
        volume: entry.volume.0.clone(),
        issue: entry.issue.0.clone(),
        page_range: entry.page_range.0.clone(),
        article_number: entry.article_number.0.clone(),
        cover_date: entry.cover_date.as_deref().and_then(parse_cover_date),
        cover_display_date: entry.cover_display_date.0.clone(),
        doi: entry.doi.0.clone(),
        pii: entry.pii.0.clone(),
        citedby_count: entry.citedby_count.parse(),
        open_access: entry.openaccess.as_deref().and_then(parse_flag),
        open_access_flag: entry.openaccess_flag.as_deref().and_then(parse_flag),
        author_keywords: split_keywords(entry.authkeywords.as_deref()),
        fund_acronym: entry.fund_acronym.0.clone(),
        fund_sponsor: entry.fund_sponsor.0.clone(),
        raw: raw.clone(),
    };

    Ok(NormalizedEntry {
        document,
        affiliations,
        authors,
        skipped_authors,
        skipped_affiliations,
    })
}

fn select_link(entry: &ScopusEntry) -> Option<String> {
    ["scopus", "scopus-citedby", "self"]
        .iter()
        .find_map(|rel| {
            entry
                .link
                .iter()
                .find(|l| l.rel.as_deref() == Some(*rel))
                .and_then(|l| l.href.0.clone())
        })
        .or_else(|| entry.prism_url.0.clone())
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM` and `YYYY`.
pub fn parse_cover_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("{value}-01-01"), "%Y-%m-%d"))
        .ok()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

pub fn split_keywords(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split('|')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Minimal page body for tests and fixtures.
pub fn page_body(total: usize, entries: &[Value]) -> Vec<u8> {
    json!({
        "search-results": {
            "opensearch:totalResults": total.to_string(),
            "entry": entries,
        }
    })
    .to_string()
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn sample_entry() -> Value {
        json!({
            "eid": "2-s2.0-85100000001",
            "dc:identifier": "SCOPUS_ID:85100000001",
            "dc:title": "Rice yield forecasting",
            "prism:url": "https://api.elsevier.com/content/abstract/scopus_id/85100000001",
            "link": [
                {"@ref": "self", "@href": "https://self"},
                {"@ref": "scopus", "@href": "https://scopus/record"}
            ],
            "source-id": 21100,
            "prism:issn": "12345678",
            "prism:isbn": [{"$": "9780000000001"}],
            "prism:coverDate": "2021-05",
            "citedby-count": "7",
            "openaccess": "1",
            "openaccessFlag": true,
            "authkeywords": "rice | forecasting|  ",
            "affiliation": {"afid": "60001", "affilname": "Khon Kaen University"},
            "author": [
                {"authid": "5701", "authname": "Doe J.", "afid": [{"$": "60001"}, {"$": "60002"}]},
                {"authname": "No Id"},
                {"authid": "5702", "orcid": "0000-0001-0000-0002", "afid": {"$": "60003"}}
            ]
        })
    }

    #[test]
    fn entry_normalizes_tolerant_shapes() {
        let normalized = normalize_entry(&sample_entry()).unwrap();
        let doc = &normalized.document;
        assert_eq!(doc.eid, "2-s2.0-85100000001");
        assert_eq!(doc.scopus_id.as_deref(), Some("85100000001"));
        assert_eq!(doc.scopus_link.as_deref(), Some("https://scopus/record"));
        assert_eq!(doc.source_id.as_deref(), Some("21100"));
        assert_eq!(doc.isbn.as_deref(), Some("9780000000001"));
        assert_eq!(doc.cover_date.map(|d| (d.year(), d.month())), Some((2021, 5)));
        assert_eq!(doc.citedby_count, Some(7));
        assert_eq!(doc.open_access, Some(true));
        assert_eq!(doc.open_access_flag, Some(true));
        assert_eq!(doc.author_keywords, vec!["rice", "forecasting"]);

        assert_eq!(normalized.affiliations.len(), 1);
        assert_eq!(normalized.authors.len(), 2);
        assert_eq!(normalized.skipped_authors, 1);
        assert_eq!(normalized.authors[0].seq, 1);
        assert_eq!(normalized.authors[0].first_afid.as_deref(), Some("60001"));
        assert_eq!(normalized.authors[1].seq, 3);
        assert_eq!(normalized.authors[1].first_afid.as_deref(), Some("60003"));
    }

    #[test]
    fn entry_without_eid_is_malformed() {
        let err = normalize_entry(&json!({"dc:title": "x"})).unwrap_err();
        assert!(matches!(err, SourceError::Malformed { what: "entry", .. }));
    }

    #[test]
    fn link_falls_back_to_prism_url() {
        let normalized = normalize_entry(&json!({
            "eid": "e1",
            "prism:url": "https://prism",
            "link": {"@ref": "author-affiliation", "@href": "https://other"}
        }))
        .unwrap();
        assert_eq!(normalized.document.scopus_link.as_deref(), Some("https://prism"));
    }

    #[test]
    fn cover_date_layouts() {
        assert_eq!(
            parse_cover_date("2020-02-29"),
            NaiveDate::from_ymd_opt(2020, 2, 29)
        );
        assert_eq!(parse_cover_date("2020-02"), NaiveDate::from_ymd_opt(2020, 2, 1));
        assert_eq!(parse_cover_date("2020"), NaiveDate::from_ymd_opt(2020, 1, 1));
        assert_eq!(parse_cover_date("soon"), None);
    }

    #[test]
    fn search_page_reads_total_and_drops_error_entry() {
        let page = parse_search_page(&page_body(30, &[json!({"eid": "a"}), json!({"eid": "b"})]))
            .unwrap();
        assert_eq!(page.total_results, 30);
        assert_eq!(page.entries.len(), 2);

        let empty = parse_search_page(
            br#"{"search-results":{"opensearch:totalResults":"0","entry":[{"@_fa":"true","error":"Result set was empty"}]}}"#,
        )
        .unwrap();
        assert_eq!(empty.total_results, 0);
        assert!(empty.entries.is_empty());

        assert!(parse_search_page(b"<html>").is_err());
    }

    #[test]
    fn request_carries_query_window_and_masked_key() {
        let request = PageRequest {
            author_id: "5701",
            start: 25,
            count: PAGE_SIZE,
            api_key: "secret-key-1234",
            import_job_id: Some(1),
            record: true,
        };
        let http = search_request(DEFAULT_SEARCH_URL, &request);
        assert!(http
            .query
            .contains(&("query".to_string(), "AU-ID(5701)".to_string())));
        assert!(http.query.contains(&("start".to_string(), "25".to_string())));
        assert!(http.query.contains(&("view".to_string(), "COMPLETE".to_string())));

        let headers = redacted_headers(&http);
        assert_eq!(headers[API_KEY_HEADER], "****1234");
        assert_eq!(headers["Accept"], "application/json");
        assert_eq!(endpoint_path(DEFAULT_SEARCH_URL), "/content/search/scopus");
    }
}
