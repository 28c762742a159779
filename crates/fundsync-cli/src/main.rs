use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fundsync_core::{JobFamily, SubjectFilter, SystemClock};
use fundsync_storage::{PgAdvisoryLock, PgStore, Store};
use fundsync_sync::{
    build_scheduler, run_until, BackfillJob, BatchReport, BatchRequest, CitationJob, JobContext,
    JobError, PersonnelJob, Providers, ScheduledJobs, ScholarJob, SyncConfig,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fundsync")]
#[command(about = "Sync external publication, citation and personnel metadata")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest citation-index documents for users with a Scopus id.
    ScopusIngest {
        #[command(flatten)]
        batch: BatchArgs,
        /// Ingest one author id only, without lock or run record.
        #[arg(long)]
        author_id: Option<String>,
    },
    /// Import scholar publications for users with a scholar author id.
    ScholarImport {
        #[command(flatten)]
        batch: BatchArgs,
        /// Import one user only, without lock or run record.
        #[arg(long, requires = "author_id")]
        user_id: Option<i64>,
        #[arg(long, requires = "user_id")]
        author_id: Option<String>,
    },
    /// Scrape the personnel directory and link profiles to users.
    PeopleImport {
        #[command(flatten)]
        batch: BatchArgs,
        /// Run the scraper in debug mode.
        #[arg(long)]
        debug: bool,
    },
    /// Fetch journal metrics for journals referenced by stored documents.
    MetricsBackfill {
        #[command(flatten)]
        batch: BatchArgs,
        /// Re-fetch journals that already have metric rows.
        #[arg(long)]
        refresh: bool,
    },
    /// List a job family's run history, newest first.
    Runs {
        family: JobFamily,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    Migrate,
    /// Run the cron scheduler until Ctrl-C.
    Schedule,
}

#[derive(Debug, Args)]
struct BatchArgs {
    /// Comma-separated user ids to restrict the batch to.
    #[arg(long, value_delimiter = ',')]
    user_ids: Vec<i64>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long, default_value = "cli")]
    trigger: String,
    /// Lock name override; an empty value runs without a lock.
    #[arg(long)]
    lock_name: Option<String>,
}

impl BatchArgs {
    fn request(&self) -> BatchRequest {
        BatchRequest {
            subjects: SubjectFilter {
                user_ids: self.user_ids.clone(),
                limit: self.limit.filter(|l| *l > 0).map(i64::from),
            },
            dry_run: self.dry_run,
            trigger: self.trigger.clone(),
            lock_name: self.lock_name.clone(),
        }
    }
}

struct App {
    store: Arc<PgStore>,
    ctx: JobContext,
    providers: Providers,
}

impl App {
    async fn connect(config: &SyncConfig) -> Result<Self> {
        let store = Arc::new(
            PgStore::connect(&config.database_url, config.pool.clone())
                .await
                .context("connecting to database")?,
        );
        let locks = Arc::new(PgAdvisoryLock::new(store.pool().clone()));
        let ctx = JobContext::new(
            store.clone() as Arc<dyn Store>,
            locks,
            Arc::new(SystemClock),
            config.config_ttl(),
        );
        ctx.api_keys
            .init(store.as_ref())
            .await
            .context("loading provider config")?;
        let providers = Providers::from_config(config, store.clone())?;
        Ok(Self {
            store,
            ctx,
            providers,
        })
    }

    fn citation(&self) -> CitationJob {
        CitationJob::new(
            self.ctx.clone(),
            self.providers.citations.clone(),
            self.providers.metrics.clone(),
        )
    }

    fn scholar(&self) -> ScholarJob {
        ScholarJob::new(self.ctx.clone(), self.providers.scholar.clone())
    }

    fn personnel(&self) -> PersonnelJob {
        PersonnelJob::new(self.ctx.clone(), self.providers.directory.clone())
    }

    fn backfill(&self) -> BackfillJob {
        BackfillJob::new(self.ctx.clone(), self.providers.metrics.clone())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancels the token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

/// 0 on success, 2 when the batch completed with failed subjects or items,
/// 1 when the run itself failed.
fn report_exit(report: &BatchReport) -> u8 {
    match (&report.failure, report.has_failures()) {
        (Some(_), _) => 1,
        (None, true) => 2,
        (None, false) => 0,
    }
}

fn print_report(report: &BatchReport) -> Result<()> {
    let out = json!({
        "run_id": report.run_id.map(|id| id.to_string()),
        "status": if report.succeeded() { "success" } else { "failed" },
        "error": report.failure.as_ref().map(|err| err.to_string()),
        "summary": report.summary,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn finish_batch(outcome: Result<BatchReport, JobError>) -> Result<u8> {
    match outcome {
        Ok(report) => {
            print_report(&report)?;
            Ok(report_exit(&report))
        }
        Err(JobError::AlreadyRunning(lock)) => {
            warn!(lock = %lock, "another run holds the lock");
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = SyncConfig::from_env();
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, config.pool.clone())
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
            Ok(0)
        }
        Commands::ScopusIngest { batch, author_id } => {
            let app = App::connect(&config).await?;
            match author_id {
                Some(author_id) => {
                    let counters = app
                        .citation()
                        .ingest_author(&author_id, batch.dry_run, &cancel)
                        .await?;
                    println!("{}", serde_json::to_string_pretty(&counters)?);
                    Ok(u8::from(counters.documents_failed > 0) * 2)
                }
                None => finish_batch(app.citation().run_batch(&batch.request(), &cancel).await),
            }
        }
        Commands::ScholarImport {
            batch,
            user_id,
            author_id,
        } => {
            let app = App::connect(&config).await?;
            match (user_id, author_id) {
                (Some(user_id), Some(author_id)) => {
                    let counters = app
                        .scholar()
                        .import_user(user_id, &author_id, batch.dry_run, &cancel)
                        .await?;
                    println!("{}", serde_json::to_string_pretty(&counters)?);
                    Ok(u8::from(counters.publications_failed > 0) * 2)
                }
                _ => finish_batch(app.scholar().run_batch(&batch.request(), &cancel).await),
            }
        }
        Commands::PeopleImport { batch, debug } => {
            let app = App::connect(&config).await?;
            finish_batch(
                app.personnel()
                    .run_batch(&batch.request(), debug, &cancel)
                    .await,
            )
        }
        Commands::MetricsBackfill { batch, refresh } => {
            let app = App::connect(&config).await?;
            finish_batch(
                app.backfill()
                    .run_batch(&batch.request(), refresh, &cancel)
                    .await,
            )
        }
        Commands::Runs {
            family,
            limit,
            offset,
        } => {
            let app = App::connect(&config).await?;
            let page = app.ctx.ledger.list(family, limit, offset).await?;
            let out = json!({ "family": family, "total": page.total, "runs": page.runs });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(0)
        }
        Commands::Schedule => {
            let app = App::connect(&config).await?;
            let jobs = ScheduledJobs {
                citation: Arc::new(app.citation()),
                scholar: Arc::new(app.scholar()),
                personnel: Arc::new(app.personnel()),
                backfill: Arc::new(app.backfill()),
            };
            let Some(sched) = build_scheduler(&config, jobs, cancel.clone()).await? else {
                anyhow::bail!("scheduler disabled; set FUNDSYNC_SCHEDULER_ENABLED=1");
            };
            info!(pool = ?app.store.pool().size(), "scheduler running, Ctrl-C to stop");
            run_until(sched, cancel.cancelled_owned()).await?;
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %format!("{err:#}"), "fundsync failed");
            ExitCode::from(1)
        }
    }
}
