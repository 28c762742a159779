//! Journal metrics lookup (`serial/title` with the CiteScore view).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundsync_core::coerce::{one_or_many, value_list, TextValue};
use fundsync_core::{percentile_to_quartile, JournalKey, JournalMetric};
use fundsync_storage::{HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::scopus::API_KEY_HEADER;
use crate::{MetricsSource, SourceError};

pub const DEFAULT_SERIAL_URL: &str = "https://api.elsevier.com/content/serial/title/issn";
pub const SERVICE: &str = "citescore";

#[derive(Debug, Deserialize)]
struct SerialEnvelope {
    #[serde(rename = "serial-metadata-response")]
    response: SerialResponse,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SerialResponse {
    #[serde(deserialize_with = "one_or_many")]
    entry: Vec<SerialEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SerialEntry {
    #[serde(rename = "source-id")]
    source_id: TextValue,
    #[serde(rename = "prism:issn")]
    issn: TextValue,
    #[serde(rename = "prism:eIssn")]
    eissn: TextValue,
    #[serde(rename = "citeScoreYearInfoList")]
    year_info_list: YearInfoList,
    #[serde(rename = "SJRList")]
    sjr_list: SjrList,
    #[serde(rename = "SNIPList")]
    snip_list: SnipList,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YearInfoList {
    #[serde(rename = "citeScoreCurrentMetric")]
    current_metric: TextValue,
    #[serde(rename = "citeScoreCurrentMetricYear")]
    current_metric_year: TextValue,
    #[serde(rename = "citeScoreTracker")]
    tracker: TextValue,
    #[serde(rename = "citeScoreTrackerYear")]
    tracker_year: TextValue,
    #[serde(rename = "citeScoreYearInfo", deserialize_with = "one_or_many")]
    years: Vec<YearInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YearInfo {
    #[serde(rename = "@year")]
    year: TextValue,
    #[serde(rename = "@status")]
    status: TextValue,
    #[serde(rename = "citeScoreInformationList")]
    information: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CiteScoreInfo {
    #[serde(rename = "docType")]
    doc_type: TextValue,
    #[serde(rename = "scholarlyOutput")]
    scholarly_output: TextValue,
    #[serde(rename = "citationCount")]
    citation_count: TextValue,
    #[serde(rename = "citeScore")]
    cite_score: TextValue,
    #[serde(rename = "percentCited")]
    percent_cited: TextValue,
    #[serde(rename = "citeScoreSubjectRank", deserialize_with = "one_or_many")]
    subject_ranks: Vec<SubjectRank>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubjectRank {
    rank: TextValue,
    percentile: TextValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SjrList {
    #[serde(rename = "SJR", deserialize_with = "one_or_many")]
    values: Vec<YearValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SnipList {
    #[serde(rename = "SNIP", deserialize_with = "one_or_many")]
    values: Vec<YearValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YearValue {
    #[serde(rename = "@year")]
    year: TextValue,
    #[serde(rename = "$")]
    value: TextValue,
}

fn by_year(values: &[YearValue]) -> HashMap<i32, f64> {
    values
        .iter()
        .filter_map(|v| Some((v.year.parse::<i32>()?, v.value.parse::<f64>()?)))
        .filter(|(year, _)| *year > 0)
        .collect()
}

/// `citeScoreInformationList` arrives as `{citeScoreInfo: ..}`, a list of
/// those wrappers, a list of infos or a bare info.
fn flatten_information(value: &Value) -> Vec<CiteScoreInfo> {
    let mut raw = Vec::new();
    for item in value_list(Some(value)) {
        match item.get("citeScoreInfo") {
            Some(inner) => raw.extend(value_list(Some(inner))),
            None => raw.push(item),
        }
    }
    raw.into_iter()
        .filter_map(|v| CiteScoreInfo::deserialize(v).ok())
        .collect()
}

/// Highest percentile wins and brings its rank along; a rank without any
/// percentile is used only when nothing better was seen.
fn best_rank(ranks: &[SubjectRank]) -> (Option<f64>, Option<i32>) {
    let mut best_percentile: Option<f64> = None;
    let mut best_rank: Option<i32> = None;
    for entry in ranks {
        let percentile = entry.percentile.parse::<f64>();
        let rank = entry.rank.parse::<i32>();
        match (percentile, best_percentile) {
            (Some(p), None) => {
                best_percentile = Some(p);
                best_rank = rank.or(best_rank);
            }
            (Some(p), Some(current)) if p > current => {
                best_percentile = Some(p);
                best_rank = rank.or(best_rank);
            }
            (None, _) if best_rank.is_none() => best_rank = rank,
            _ => {}
        }
    }
    (best_percentile, best_rank)
}

/// Parses a serial metadata response into one row per (year, document type).
/// `journal` supplies the identity when the payload carries no source id.
pub fn parse_metrics(
    body: &[u8],
    journal: &JournalKey,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<JournalMetric>, SourceError> {
    let envelope: SerialEnvelope = serde_json::from_slice(body)
        .map_err(|err| SourceError::malformed("serial metadata", err.to_string()))?;
    let Some(entry) = envelope.response.entry.into_iter().next() else {
        return Ok(Vec::new());
    };

    let issn = entry.issn.0.clone().or_else(|| journal.issn.clone());
    let source_id = entry
        .source_id
        .0
        .clone()
        .or_else(|| journal.metric_identity().map(str::to_string))
        .or_else(|| issn.clone());
    let Some(source_id) = source_id else {
        return Ok(Vec::new());
    };

    let sjr = by_year(&entry.sjr_list.values);
    let snip = by_year(&entry.snip_list.values);
    let list = &entry.year_info_list;

    let mut metrics = Vec::new();
    for year_info in &list.years {
        let Some(metric_year) = year_info.year.parse::<i32>().filter(|y| *y > 0) else {
            continue;
        };
        for info in flatten_information(&year_info.information) {
            let (percentile, rank) = best_rank(&info.subject_ranks);
            metrics.push(JournalMetric {
                source_id: source_id.clone(),
                issn: issn.clone(),
                eissn: entry.eissn.0.clone(),
                metric_year,
                doc_type: info.doc_type.0.clone().unwrap_or_else(|| "all".to_string()),
                cite_score: info.cite_score.parse(),
                cite_score_status: year_info.status.0.clone(),
                scholarly_output: info.scholarly_output.parse(),
                citation_count: info.citation_count.parse(),
                percent_cited: info.percent_cited.parse(),
                rank,
                percentile,
                quartile: percentile_to_quartile(percentile),
                current_metric: list.current_metric.parse(),
                current_metric_year: list.current_metric_year.parse(),
                tracker: list.tracker.parse(),
                tracker_year: list.tracker_year.parse(),
                sjr: sjr.get(&metric_year).copied(),
                snip: snip.get(&metric_year).copied(),
                last_fetched_at: fetched_at,
            });
        }
    }
    Ok(metrics)
}

pub fn metrics_request(base_url: &str, lookup_id: &str, api_key: &str) -> Result<HttpRequest, SourceError> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|err| SourceError::malformed("metrics url", err.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| SourceError::malformed("metrics url", base_url.to_string()))?
        .pop_if_empty()
        .push(lookup_id);
    Ok(HttpRequest::get(url.to_string())
        .query("view", "CITESCORE")
        .header("Accept", "application/json")
        .header(API_KEY_HEADER, api_key))
}

pub struct CiteScoreClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl CiteScoreClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MetricsSource for CiteScoreClient {
    async fn journal_metrics(
        &self,
        journal: &JournalKey,
        api_key: &str,
    ) -> Result<Vec<JournalMetric>, SourceError> {
        let Some(lookup_id) = journal.lookup_id() else {
            return Ok(Vec::new());
        };
        let request = metrics_request(&self.base_url, lookup_id, api_key)?;
        let response = self.http.get(SERVICE, &request).await?;
        let metrics = parse_metrics(&response.body, journal, Utc::now())?;
        debug!(journal = %journal.dedupe_key(), rows = metrics.len(), "journal metrics fetched");
        Ok(metrics)
    }
}
