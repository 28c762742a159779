//! Postgres implementation of the store seams.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use fundsync_core::{
    AffiliationRecord, AuthorRecord, DocumentAuthorLink, DocumentRecord, JobFamily, JobRun,
    JournalKey, JournalMetric, JournalTarget, MetricMatch, NewJobRun, PersonProfile, ProfileLinkStats,
    PublicationKey, RunCompletion, RunSummary, ScholarAuthorIndices, ScholarPublication, Subject,
    SubjectFilter,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::*;
use crate::StoreError;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 10,
        }
    }
}

const SLOW_QUERY: Duration = Duration::from_millis(250);

const RUN_COLUMNS: &str = "id, job_family, trigger_source, dry_run, status, started_at, finished_at, \
     duration_ms, error_message, summary, stdout, stderr, exit_code, requested_subject_ids, subject_limit";

/// Same normalization as [`normalize_profile_ref`], in SQL.
fn sql_profile_ref(column: &str) -> String {
    format!(
        r"btrim(regexp_replace(lower(btrim({column})), '^(https://)?(http://)?(www\.)?(computing\.kku\.ac\.th/)?', ''), '/')"
    )
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn warn_if_slow(operation: &str, started: Instant) {
    let elapsed = started.elapsed();
    if elapsed > SLOW_QUERY {
        warn!(operation, elapsed_ms = elapsed.as_millis() as u64, "slow database operation");
    }
}

fn job_run_from_row(row: &PgRow) -> Result<JobRun, StoreError> {
    let family: String = row.try_get("job_family")?;
    let status: String = row.try_get("status")?;
    let summary: Option<serde_json::Value> = row.try_get("summary")?;
    let summary = summary
        .map(serde_json::from_value::<RunSummary>)
        .transpose()?;
    Ok(JobRun {
        id: row.try_get("id")?,
        job_family: family.parse().map_err(StoreError::Message)?,
        trigger_source: row.try_get("trigger_source")?,
        dry_run: row.try_get("dry_run")?,
        status: status.parse().map_err(StoreError::Message)?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        error_message: row.try_get("error_message")?,
        summary,
        stdout: row.try_get("stdout")?,
        stderr: row.try_get("stderr")?,
        exit_code: row.try_get("exit_code")?,
        requested_subject_ids: row.try_get("requested_subject_ids")?,
        subject_limit: row.try_get("subject_limit")?,
    })
}

fn upserted_from_row(row: &PgRow) -> Result<Upserted, StoreError> {
    Ok(Upserted {
        id: row.try_get("id")?,
        created: row.try_get("inserted")?,
    })
}

#[async_trait]
impl RunStore for PgStore {
    async fn insert_run(&self, run: &NewJobRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs
                (id, job_family, trigger_source, dry_run, status, started_at,
                 requested_subject_ids, subject_limit)
            VALUES ($1, $2, $3, $4, 'running', $5, $6, $7)
            "#,
        )
        .bind(run.id)
        .bind(run.job_family.as_str())
        .bind(&run.trigger_source)
        .bind(run.dry_run)
        .bind(run.started_at)
        .bind(&run.requested_subject_ids)
        .bind(run.subject_limit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_run(&self, id: Uuid, completion: &RunCompletion) -> Result<bool, StoreError> {
        let summary = completion
            .summary
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2,
                finished_at = $3,
                duration_ms = $4,
                summary = $5,
                stdout = $6,
                stderr = $7,
                exit_code = $8,
                error_message = $9
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(completion.status.as_str())
        .bind(completion.finished_at)
        .bind(completion.duration_ms)
        .bind(summary)
        .bind(&completion.stdout)
        .bind(&completion.stderr)
        .bind(completion.exit_code)
        .bind(&completion.error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn run_by_id(&self, id: Uuid) -> Result<Option<JobRun>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_run_from_row).transpose()
    }

    async fn latest_completed_run(&self, family: JobFamily) -> Result<Option<JobRun>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs \
             WHERE job_family = $1 AND status <> 'running' \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(family.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_run_from_row).transpose()
    }

    async fn running_run(&self, family: JobFamily) -> Result<Option<JobRun>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs \
             WHERE job_family = $1 AND status = 'running' \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(family.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_run_from_row).transpose()
    }

    async fn list_runs(
        &self,
        family: JobFamily,
        limit: i64,
        offset: i64,
    ) -> Result<RunPage, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_runs WHERE job_family = $1")
            .bind(family.as_str())
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_family = $1 \
             ORDER BY started_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(family.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let runs = rows
            .iter()
            .map(job_run_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RunPage { runs, total })
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn config_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<Option<String>> = sqlx::query_scalar(
            "SELECT config_value FROM provider_config WHERE config_key = $1 LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value.flatten())
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn open_import_job(&self, job: &NewImportJob) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO api_import_jobs (service, job_type, query_string, status, started_at)
            VALUES ($1, $2, $3, 'running', $4)
            RETURNING id
            "#,
        )
        .bind(&job.service)
        .bind(&job.job_type)
        .bind(&job.query_string)
        .bind(job.started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn set_import_job_total(&self, id: i64, total_results: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE api_import_jobs SET total_results = $2 WHERE id = $1")
            .bind(id)
            .bind(total_results)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close_import_job(
        &self,
        id: i64,
        status: ImportJobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE api_import_jobs
            SET status = $2, error_message = $3, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_api_request(&self, record: &ApiRequestRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO api_requests
                (import_job_id, service, http_method, endpoint, query_params, request_headers,
                 response_status, response_time_ms, page_start, page_count, items_returned,
                 error_message, requested_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.import_job_id)
        .bind(&record.service)
        .bind(&record.http_method)
        .bind(&record.endpoint)
        .bind(&record.query_params)
        .bind(&record.request_headers)
        .bind(record.response_status)
        .bind(record.response_time_ms)
        .bind(record.page_start)
        .bind(record.page_count)
        .bind(record.items_returned)
        .bind(&record.error_message)
        .bind(record.requested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubjectStore for PgStore {
    async fn eligible_subjects(
        &self,
        family: JobFamily,
        filter: &SubjectFilter,
    ) -> Result<Vec<Subject>, StoreError> {
        let column = match family {
            JobFamily::CitationIndex => "scopus_id",
            JobFamily::ScholarProfile => "scholar_author_id",
            other => {
                return Err(StoreError::message(format!(
                    "job family {other} has no per-user subjects"
                )))
            }
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT user_id, btrim({column}) AS external_id
            FROM users
            WHERE {column} IS NOT NULL AND btrim({column}) <> ''
              AND (cardinality($1::BIGINT[]) = 0 OR user_id = ANY($1))
            ORDER BY user_id ASC
            LIMIT $2
            "#
        ))
        .bind(&filter.user_ids)
        .bind(filter.limit.filter(|l| *l > 0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Subject {
                    user_id: row.try_get("user_id")?,
                    external_id: row.try_get("external_id")?,
                })
            })
            .collect()
    }
}

struct PgDocumentTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl DocumentTx for PgDocumentTx {
    async fn document_id(&mut self, eid: &str) -> Result<Option<i64>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT id FROM external_documents WHERE eid = $1")
                .bind(eid)
                .fetch_optional(&mut *self.tx)
                .await?,
        )
    }

    async fn upsert_document(&mut self, doc: &DocumentRecord) -> Result<Upserted, StoreError> {
        let started = Instant::now();
        let row = sqlx::query(
            r#"
            INSERT INTO external_documents
                (eid, scopus_id, scopus_link, title, abstract_text, aggregation_type, subtype,
                 subtype_description, source_id, publication_name, issn, eissn, isbn, volume,
                 issue, page_range, article_number, cover_date, cover_display_date, doi, pii,
                 citedby_count, open_access, open_access_flag, author_keywords, fund_acronym,
                 fund_sponsor, raw_json)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)
            ON CONFLICT (eid) DO UPDATE SET
                scopus_id = EXCLUDED.scopus_id,
                scopus_link = EXCLUDED.scopus_link,
                title = EXCLUDED.title,
                abstract_text = EXCLUDED.abstract_text,
                aggregation_type = EXCLUDED.aggregation_type,
                subtype = EXCLUDED.subtype,
                subtype_description = EXCLUDED.subtype_description,
                source_id = EXCLUDED.source_id,
                publication_name = EXCLUDED.publication_name,
                issn = EXCLUDED.issn,
                eissn = EXCLUDED.eissn,
                isbn = EXCLUDED.isbn,
                volume = EXCLUDED.volume,
                issue = EXCLUDED.issue,
                page_range = EXCLUDED.page_range,
                article_number = EXCLUDED.article_number,
                cover_date = EXCLUDED.cover_date,
                cover_display_date = EXCLUDED.cover_display_date,
                doi = EXCLUDED.doi,
                pii = EXCLUDED.pii,
                citedby_count = EXCLUDED.citedby_count,
                open_access = EXCLUDED.open_access,
                open_access_flag = EXCLUDED.open_access_flag,
                author_keywords = EXCLUDED.author_keywords,
                fund_acronym = EXCLUDED.fund_acronym,
                fund_sponsor = EXCLUDED.fund_sponsor,
                raw_json = EXCLUDED.raw_json,
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&doc.eid)
        .bind(&doc.scopus_id)
        .bind(&doc.scopus_link)
        .bind(&doc.title)
        .bind(&doc.abstract_text)
        .bind(&doc.aggregation_type)
        .bind(&doc.subtype)
        .bind(&doc.subtype_description)
        .bind(&doc.source_id)
        .bind(&doc.publication_name)
        .bind(&doc.issn)
        .bind(&doc.eissn)
        .bind(&doc.isbn)
        .bind(&doc.volume)
        .bind(&doc.issue)
        .bind(&doc.page_range)
        .bind(&doc.article_number)
        .bind(doc.cover_date)
        .bind(&doc.cover_display_date)
        .bind(&doc.doi)
        .bind(&doc.pii)
        .bind(doc.citedby_count)
        .bind(doc.open_access)
        .bind(doc.open_access_flag)
        .bind(Json(&doc.author_keywords))
        .bind(&doc.fund_acronym)
        .bind(&doc.fund_sponsor)
        .bind(&doc.raw)
        .fetch_one(&mut *self.tx)
        .await?;
        warn_if_slow("upsert_document", started);
        upserted_from_row(&row)
    }

    async fn affiliation_id(&mut self, afid: &str) -> Result<Option<i64>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT id FROM external_affiliations WHERE afid = $1")
                .bind(afid)
                .fetch_optional(&mut *self.tx)
                .await?,
        )
    }

    async fn upsert_affiliation(
        &mut self,
        affiliation: &AffiliationRecord,
    ) -> Result<Upserted, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO external_affiliations (afid, name, city, country, url)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (afid) DO UPDATE SET
                name = EXCLUDED.name,
                city = EXCLUDED.city,
                country = EXCLUDED.country,
                url = EXCLUDED.url,
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&affiliation.afid)
        .bind(&affiliation.name)
        .bind(&affiliation.city)
        .bind(&affiliation.country)
        .bind(&affiliation.url)
        .fetch_one(&mut *self.tx)
        .await?;
        upserted_from_row(&row)
    }

    async fn author_id(&mut self, external_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT id FROM external_authors WHERE author_id = $1")
                .bind(external_id)
                .fetch_optional(&mut *self.tx)
                .await?,
        )
    }

    async fn upsert_author(&mut self, author: &AuthorRecord) -> Result<Upserted, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO external_authors
                (author_id, full_name, given_name, surname, initials, orcid, author_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (author_id) DO UPDATE SET
                full_name = EXCLUDED.full_name,
                given_name = EXCLUDED.given_name,
                surname = EXCLUDED.surname,
                initials = EXCLUDED.initials,
                orcid = COALESCE(NULLIF(btrim(EXCLUDED.orcid), ''), external_authors.orcid),
                author_url = EXCLUDED.author_url,
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&author.author_id)
        .bind(&author.full_name)
        .bind(&author.given_name)
        .bind(&author.surname)
        .bind(&author.initials)
        .bind(&author.orcid)
        .bind(&author.author_url)
        .fetch_one(&mut *self.tx)
        .await?;
        upserted_from_row(&row)
    }

    async fn link_exists(&mut self, document_id: i64, author_id: i64) -> Result<bool, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM document_authors WHERE document_id = $1 AND author_id = $2)",
        )
        .bind(document_id)
        .bind(author_id)
        .fetch_one(&mut *self.tx)
        .await?)
    }

    async fn upsert_link(&mut self, link: &DocumentAuthorLink) -> Result<Upserted, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO document_authors (document_id, author_id, author_seq, affiliation_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (document_id, author_id) DO UPDATE SET
                author_seq = EXCLUDED.author_seq,
                affiliation_id = EXCLUDED.affiliation_id,
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(link.document_id)
        .bind(link.author_id)
        .bind(link.author_seq)
        .bind(link.affiliation_id)
        .fetch_one(&mut *self.tx)
        .await?;
        upserted_from_row(&row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn begin_document(&self) -> Result<Box<dyn DocumentTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgDocumentTx { tx }))
    }
}

#[async_trait]
impl MetricStore for PgStore {
    async fn metric_exists(
        &self,
        journal: &JournalKey,
        year: Option<i32>,
    ) -> Result<bool, StoreError> {
        let (sql, value) = match journal.metric_match() {
            Some(MetricMatch::SourceId(source_id)) => (
                "SELECT EXISTS (SELECT 1 FROM journal_metrics \
                 WHERE source_id = $1 AND ($2::INT IS NULL OR metric_year = $2))",
                source_id,
            ),
            Some(MetricMatch::Issn(issn)) => (
                "SELECT EXISTS (SELECT 1 FROM journal_metrics \
                 WHERE issn = $1 AND ($2::INT IS NULL OR metric_year = $2))",
                issn,
            ),
            None => return Ok(false),
        };
        Ok(sqlx::query_scalar(sql)
            .bind(value)
            .bind(year)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn upsert_metric(&self, metric: &JournalMetric) -> Result<Upserted, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO journal_metrics
                (source_id, issn, eissn, metric_year, doc_type, cite_score, cite_score_status,
                 scholarly_output, citation_count, percent_cited, rank, percentile, quartile,
                 current_metric, current_metric_year, tracker, tracker_year, sjr, snip,
                 last_fetched_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20)
            ON CONFLICT (source_id, metric_year, doc_type) DO UPDATE SET
                issn = EXCLUDED.issn,
                eissn = EXCLUDED.eissn,
                cite_score = EXCLUDED.cite_score,
                cite_score_status = EXCLUDED.cite_score_status,
                scholarly_output = EXCLUDED.scholarly_output,
                citation_count = EXCLUDED.citation_count,
                percent_cited = EXCLUDED.percent_cited,
                rank = EXCLUDED.rank,
                percentile = EXCLUDED.percentile,
                quartile = EXCLUDED.quartile,
                current_metric = EXCLUDED.current_metric,
                current_metric_year = EXCLUDED.current_metric_year,
                tracker = EXCLUDED.tracker,
                tracker_year = EXCLUDED.tracker_year,
                sjr = EXCLUDED.sjr,
                snip = EXCLUDED.snip,
                last_fetched_at = EXCLUDED.last_fetched_at,
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&metric.source_id)
        .bind(&metric.issn)
        .bind(&metric.eissn)
        .bind(metric.metric_year)
        .bind(&metric.doc_type)
        .bind(metric.cite_score)
        .bind(&metric.cite_score_status)
        .bind(metric.scholarly_output)
        .bind(metric.citation_count)
        .bind(metric.percent_cited)
        .bind(metric.rank)
        .bind(metric.percentile)
        .bind(metric.quartile.map(|q| q.as_str()))
        .bind(metric.current_metric)
        .bind(metric.current_metric_year)
        .bind(metric.tracker)
        .bind(metric.tracker_year)
        .bind(metric.sjr)
        .bind(metric.snip)
        .bind(metric.last_fetched_at)
        .fetch_one(&self.pool)
        .await?;
        upserted_from_row(&row)
    }

    async fn journal_targets(&self) -> Result<Vec<JournalTarget>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT NULLIF(btrim(issn), '') AS issn,
                   NULLIF(btrim(source_id), '') AS source_id,
                   MAX(cover_date) AS latest_cover_date
            FROM external_documents
            WHERE COALESCE(btrim(issn), '') <> '' OR COALESCE(btrim(source_id), '') <> ''
            GROUP BY 1, 2
            ORDER BY 2 NULLS LAST, 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(JournalTarget {
                    key: JournalKey {
                        issn: row.try_get("issn")?,
                        source_id: row.try_get("source_id")?,
                    },
                    latest_cover_date: row.try_get("latest_cover_date")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PublicationStore for PgStore {
    async fn find_publication(&self, key: &PublicationKey) -> Result<Option<i64>, StoreError> {
        let id = match key {
            PublicationKey::Doi { user_id, doi } => {
                sqlx::query_scalar(
                    "SELECT id FROM scholar_publications \
                     WHERE user_id = $1 AND lower(btrim(doi)) = $2 ORDER BY id LIMIT 1",
                )
                .bind(user_id)
                .bind(doi)
                .fetch_optional(&self.pool)
                .await?
            }
            PublicationKey::Fingerprint {
                user_id,
                fingerprint,
            } => {
                sqlx::query_scalar(
                    "SELECT id FROM scholar_publications \
                     WHERE user_id = $1 AND fingerprint = $2 ORDER BY id LIMIT 1",
                )
                .bind(user_id)
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(id)
    }

    async fn insert_publication(&self, publication: &ScholarPublication) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO scholar_publications
                (user_id, title, authors, venue, pub_year, doi, url, cited_by, cited_by_url,
                 cluster_id, cites_per_year, fingerprint)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(publication.user_id)
        .bind(&publication.title)
        .bind(Json(&publication.authors))
        .bind(&publication.venue)
        .bind(publication.year)
        .bind(&publication.doi)
        .bind(&publication.url)
        .bind(publication.cited_by)
        .bind(&publication.cited_by_url)
        .bind(&publication.cluster_id)
        .bind(Json(&publication.cites_per_year))
        .bind(&publication.fingerprint)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_publication(
        &self,
        id: i64,
        publication: &ScholarPublication,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scholar_publications SET
                title = $2, authors = $3, venue = $4, pub_year = $5, doi = $6, url = $7,
                cited_by = $8, cited_by_url = $9, cluster_id = $10, cites_per_year = $11,
                fingerprint = $12, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&publication.title)
        .bind(Json(&publication.authors))
        .bind(&publication.venue)
        .bind(publication.year)
        .bind(&publication.doi)
        .bind(&publication.url)
        .bind(publication.cited_by)
        .bind(&publication.cited_by_url)
        .bind(&publication.cluster_id)
        .bind(Json(&publication.cites_per_year))
        .bind(&publication.fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_author_indices(
        &self,
        user_id: i64,
        indices: &ScholarAuthorIndices,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_scholar_metrics
                (user_id, h_index, h_index_5y, i10_index, i10_index_5y, cited_by_total,
                 cited_by_5y, cites_per_year)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id) DO UPDATE SET
                h_index = EXCLUDED.h_index,
                h_index_5y = EXCLUDED.h_index_5y,
                i10_index = EXCLUDED.i10_index,
                i10_index_5y = EXCLUDED.i10_index_5y,
                cited_by_total = EXCLUDED.cited_by_total,
                cited_by_5y = EXCLUDED.cited_by_5y,
                cites_per_year = EXCLUDED.cites_per_year,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(indices.h_index)
        .bind(indices.h_index_5y)
        .bind(indices.i10_index)
        .bind(indices.i10_index_5y)
        .bind(indices.cited_by_total)
        .bind(indices.cited_by_5y)
        .bind(Json(&indices.cites_per_year))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn profiles_by_url(&self, urls: &[String]) -> Result<Vec<PersonProfile>, StoreError> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT profile_url, name_th, name_en, position, email, photo_url, info, education
            FROM person_profiles
            WHERE profile_url = ANY($1)
            "#,
        )
        .bind(urls)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(PersonProfile {
                    profile_url: row.try_get("profile_url")?,
                    name_th: row.try_get("name_th")?,
                    name_en: row.try_get("name_en")?,
                    position: row.try_get("position")?,
                    email: row.try_get("email")?,
                    photo_url: row.try_get("photo_url")?,
                    info: row.try_get("info")?,
                    education: row.try_get("education")?,
                })
            })
            .collect()
    }

    async fn upsert_profile(&self, profile: &PersonProfile) -> Result<Upserted, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO person_profiles
                (profile_url, name_th, name_en, position, email, photo_url, info, education)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (profile_url) DO UPDATE SET
                name_th = EXCLUDED.name_th,
                name_en = EXCLUDED.name_en,
                position = EXCLUDED.position,
                email = EXCLUDED.email,
                photo_url = EXCLUDED.photo_url,
                info = EXCLUDED.info,
                education = EXCLUDED.education,
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&profile.profile_url)
        .bind(&profile.name_th)
        .bind(&profile.name_en)
        .bind(&profile.position)
        .bind(&profile.email)
        .bind(&profile.photo_url)
        .bind(&profile.info)
        .bind(&profile.education)
        .fetch_one(&self.pool)
        .await?;
        upserted_from_row(&row)
    }

    async fn link_profiles_to_users(&self) -> Result<ProfileLinkStats, StoreError> {
        let started = Instant::now();
        let by_email = sqlx::query(
            r#"
            UPDATE person_profiles p
            SET user_id = u.user_id, updated_at = NOW()
            FROM users u
            WHERE p.user_id IS NULL
              AND COALESCE(btrim(p.email), '') <> ''
              AND lower(btrim(p.email)) = lower(btrim(u.email))
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        let profile_ref = sql_profile_ref("p.profile_url");
        let user_ref = sql_profile_ref("u.cp_web_id");
        let by_url = sqlx::query(&format!(
            r#"
            UPDATE person_profiles p
            SET user_id = u.user_id, updated_at = NOW()
            FROM users u
            WHERE p.user_id IS NULL
              AND COALESCE(btrim(u.cp_web_id), '') <> ''
              AND {profile_ref} = {user_ref}
            "#
        ))
        .execute(&self.pool)
        .await?
        .rows_affected();
        warn_if_slow("link_profiles_to_users", started);

        Ok(ProfileLinkStats {
            linked_by_email: by_email as usize,
            linked_by_profile_url: by_url as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_ref_sql_wraps_column() {
        let sql = sql_profile_ref("u.cp_web_id");
        assert!(sql.contains("lower(btrim(u.cp_web_id))"));
        assert!(sql.starts_with("btrim(regexp_replace("));
    }

    #[test]
    fn pool_defaults_are_small() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.min_connections, 1);
    }
}
