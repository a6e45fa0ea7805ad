//! candata-ingest - run and inspect ingestion jobs

use anyhow::{Context, Result};
use candata_common::logging::{init_logging, LogConfig, LogLevel};
use candata_ingest::cache::DiskCache;
use candata_ingest::checkpoint::CheckpointStore;
use candata_ingest::config::{duration_from_hours, IngestConfig};
use candata_ingest::db;
use candata_ingest::download::ResumableDownloader;
use candata_ingest::job::{self, FileJob, IngestContext};
use candata_ingest::sink::{BatchUpsertSink, LoadStatus, MemoryTarget, PgUpsertTarget, RestUpsertTarget, UpsertTarget};
use candata_ingest::tracker::{JobRunTracker, MemoryRunStore, PgRunStore};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "candata-ingest")]
#[command(author, version, about = "candata data ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a file into the cache (reusing a fresh copy)
    Fetch {
        url: String,

        /// Cache file name; derived from the URL when omitted
        #[arg(short, long)]
        filename: Option<String>,

        /// Reuse a cached copy younger than this
        #[arg(long)]
        max_age_hours: Option<f64>,
    },

    /// Download a CSV and upsert it into a table, resuming from the last checkpoint
    Load {
        url: String,

        /// Job name, used for checkpoints and run records
        #[arg(long)]
        job: String,

        /// Source name recorded on the run
        #[arg(long, default_value = "manual")]
        source: String,

        /// Target table
        #[arg(long)]
        table: String,

        /// Conflict columns forming the unique key
        #[arg(long, value_delimiter = ',', required = true)]
        conflict: Vec<String>,

        /// Only load these columns
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,

        /// Cache file name; derived from the URL when omitted
        #[arg(short, long)]
        filename: Option<String>,

        /// Upsert into memory instead of the configured store
        #[arg(long)]
        dry_run: bool,
    },

    /// List recent job runs
    Runs {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Inspect or reset checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointAction {
    /// Show one job's offset, or all of them
    Show { job: Option<String> },

    /// Reset a job so its next run starts from row 0
    Clear { job: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("candata-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Command::Fetch {
            url,
            filename,
            max_age_hours,
        } => {
            let cache = DiskCache::new(
                config.cache.dir.clone(),
                Arc::new(ResumableDownloader::new(&config.download)?),
            );
            let filename = filename.unwrap_or_else(|| DiskCache::cache_filename(&url));
            let max_age = max_age_hours
                .map(duration_from_hours)
                .unwrap_or_else(|| config.cache.max_age());

            let path = cache.get_or_download(&url, &filename, max_age).await?;
            println!("{}", path.display());
            Ok(ExitCode::SUCCESS)
        },

        Command::Load {
            url,
            job: job_name,
            source,
            table,
            conflict,
            columns,
            filename,
            dry_run,
        } => {
            let (target, tracker) = build_backend(&config, dry_run).await?;
            let sink = BatchUpsertSink::from_config(target, &config.sink);
            let ctx = IngestContext::from_config(config, tracker, sink)?;

            let file_job = FileJob {
                job_name,
                source_name: source,
                url,
                filename,
                table,
                conflict_columns: conflict,
                columns,
                metadata: serde_json::json!({ "dry_run": dry_run }),
            };

            let report = job::run_file_job(&ctx, &file_job, job::passthrough().as_ref()).await?;

            println!(
                "{}: {} loaded, {} failed, {} rows read (resumed from {}), run {}",
                report.status(),
                report.result.records_loaded,
                report.result.records_failed,
                report.rows_read,
                report.resumed_from,
                report.run.id
            );
            for error in &report.result.errors {
                println!("  {error}");
            }

            Ok(match report.status() {
                LoadStatus::Success => ExitCode::SUCCESS,
                LoadStatus::PartialFailure | LoadStatus::Failure => ExitCode::FAILURE,
            })
        },

        Command::Runs { limit } => {
            let pool = db::create_pool(&config.database).await?;
            let store = PgRunStore::new(pool);
            store.ensure_schema().await?;

            for run in JobRunTracker::new(Arc::new(store)).recent(limit).await? {
                println!(
                    "{}  {:<16} {:<24} {:<16} loaded={:<8} rejected={:<6} {}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.status.as_str(),
                    run.job_name,
                    run.source_name,
                    run.records_loaded,
                    run.records_rejected,
                    run.error_message.as_deref().unwrap_or("")
                );
            }
            Ok(ExitCode::SUCCESS)
        },

        Command::Checkpoint { action } => {
            let store = CheckpointStore::new(&config.checkpoint.file);
            match action {
                CheckpointAction::Show { job: Some(job) } => {
                    println!("{job}: {}", store.load_async(&job).await?);
                },
                CheckpointAction::Show { job: None } => {
                    for (job, rows) in store.entries_async().await? {
                        println!("{job}: {rows}");
                    }
                },
                CheckpointAction::Clear { job } => {
                    store.clear_async(&job).await?;
                    info!(job = %job, "checkpoint cleared");
                },
            }
            Ok(ExitCode::SUCCESS)
        },
    }
}

/// Pick the upsert target and run store for a load
///
/// Postgres when `DATABASE_URL` is set, otherwise the REST endpoint; run
/// records are only persisted with Postgres.
async fn build_backend(config: &IngestConfig, dry_run: bool) -> Result<(Arc<dyn UpsertTarget>, JobRunTracker)> {
    if dry_run {
        info!("dry run: upserting into memory");
        return Ok((Arc::new(MemoryTarget::new()), JobRunTracker::in_memory()));
    }

    if config.database.url.is_some() {
        let pool = db::create_pool(&config.database).await?;
        db::health_check(&pool).await.context("Database health check failed")?;
        let store = PgRunStore::new(pool.clone());
        store.ensure_schema().await?;
        return Ok((Arc::new(PgUpsertTarget::new(pool)), JobRunTracker::new(Arc::new(store))));
    }

    let limiter = Arc::new(config.rate_limit.limiter());
    let target = RestUpsertTarget::from_config(&config.rest, config.retry.policy())
        .context("Set DATABASE_URL or CANDATA_REST_URL and CANDATA_REST_KEY")?
        .with_rate_limiter(limiter);
    warn!("no DATABASE_URL: run records are kept in memory only");
    Ok((Arc::new(target), JobRunTracker::new(Arc::new(MemoryRunStore::default()))))
}
