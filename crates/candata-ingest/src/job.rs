//! File-driven ingestion jobs
//!
//! [`run_file_job`] wires the reliability components into one resumable
//! loop: download through the cache, read the file in bounded chunks from
//! the last checkpoint, transform and upsert each chunk, and persist the
//! checkpoint before the next chunk is read. A crash at any point leaves a
//! checkpoint that is safe to resume from, and replayed rows are absorbed
//! by the idempotent upserts.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::DiskCache;
use crate::checkpoint::CheckpointStore;
use crate::config::{CheckpointMode, IngestConfig};
use crate::download::{Fetcher, ResumableDownloader};
use crate::error::{IngestError, Result};
use crate::memory::{MemoryGuard, RssWatch};
use crate::sink::{BatchUpsertSink, LoadResult, LoadStatus};
use crate::stream::{stream_chunks, ChunkReader, Record, RecordBatch, StreamOptions};
use crate::tracker::{JobRun, JobRunTracker, RunExtra};

/// Per-chunk record transformation supplied by the caller
pub type Transform = Arc<dyn Fn(Vec<Record>) -> Result<Vec<Record>> + Send + Sync>;

/// Transform that forwards rows unchanged
pub fn passthrough() -> Transform {
    Arc::new(Ok::<Vec<Record>, IngestError>)
}

/// Everything a job needs, constructed once and passed explicitly
#[derive(Debug, Clone)]
pub struct IngestContext {
    pub config: IngestConfig,
    pub cache: DiskCache,
    pub checkpoints: CheckpointStore,
    pub memory_guard: MemoryGuard,
    pub tracker: JobRunTracker,
    pub sink: BatchUpsertSink,
}

impl IngestContext {
    pub fn new(
        config: IngestConfig,
        cache: DiskCache,
        checkpoints: CheckpointStore,
        tracker: JobRunTracker,
        sink: BatchUpsertSink,
    ) -> Self {
        let memory_guard = config.memory.guard();
        Self {
            config,
            cache,
            checkpoints,
            memory_guard,
            tracker,
            sink,
        }
    }

    /// Build the cache and checkpoint store from configuration
    pub fn from_config(config: IngestConfig, tracker: JobRunTracker, sink: BatchUpsertSink) -> Result<Self> {
        let downloader: Arc<dyn Fetcher> = Arc::new(ResumableDownloader::new(&config.download)?);
        let cache = DiskCache::new(config.cache.dir.clone(), downloader);
        let checkpoints = CheckpointStore::new(config.checkpoint.file.clone());
        Ok(Self::new(config, cache, checkpoints, tracker, sink))
    }

    pub fn with_memory_guard(mut self, guard: MemoryGuard) -> Self {
        self.memory_guard = guard;
        self
    }
}

/// One file to fetch and load into one table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileJob {
    pub job_name: String,
    pub source_name: String,
    pub url: String,
    /// Cache file name; derived from the URL when absent
    pub filename: Option<String>,
    pub table: String,
    pub conflict_columns: Vec<String>,
    /// Columns to read; all when absent
    pub columns: Option<Vec<String>>,
    /// Stored on the run record
    pub metadata: Value,
}

impl FileJob {
    pub fn cache_filename(&self) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| DiskCache::cache_filename(&self.url))
    }
}

/// What a completed job did
#[derive(Debug, Clone)]
pub struct JobReport {
    pub run: JobRun,
    pub result: LoadResult,
    pub resumed_from: u64,
    pub rows_read: u64,
    /// Offset left in the checkpoint store; 0 when cleared
    pub checkpoint: u64,
}

impl JobReport {
    pub fn status(&self) -> LoadStatus {
        self.result.status()
    }
}

/// Result of one job inside [`run_jobs`]
#[derive(Debug)]
pub struct JobOutcome {
    pub job_name: String,
    pub result: Result<JobReport>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(&self.result, Ok(report) if report.status() == LoadStatus::Success)
    }
}

/// Progress of the chunk loop, kept apart so a mid-run error can report it
#[derive(Debug)]
struct ChunkLoop {
    result: LoadResult,
    rows_read: u64,
    watermark: u64,
    committed: bool,
}

/// Fetch, stream, transform, upsert and checkpoint one file
#[instrument(skip(ctx, job, transform), fields(job = %job.job_name, table = %job.table))]
pub async fn run_file_job(
    ctx: &IngestContext,
    job: &FileJob,
    transform: &(dyn Fn(Vec<Record>) -> Result<Vec<Record>> + Send + Sync),
) -> Result<JobReport> {
    let run_id = ctx
        .tracker
        .register(&job.job_name, &job.source_name, job.metadata.clone())
        .await?;

    let resumed_from = match ctx.checkpoints.load_async(&job.job_name).await {
        Ok(offset) => offset,
        Err(err) => return Err(fail_run(ctx, run_id, err).await),
    };

    let path = match ctx
        .cache
        .get_or_download(&job.url, &job.cache_filename(), ctx.config.cache.max_age())
        .await
    {
        Ok(path) => path,
        Err(err) => return Err(fail_run(ctx, run_id, err).await),
    };

    ctx.tracker.begin(run_id).await?;

    let mut progress = ChunkLoop {
        result: LoadResult::new(&job.table),
        rows_read: 0,
        watermark: resumed_from,
        committed: true,
    };

    let started = Instant::now();
    let rss = RssWatch::start(&job.job_name);
    let driven = drive_chunks(ctx, job, path, transform, resumed_from, &mut progress).await;
    let rss_delta = rss.finish();
    if let Err(err) = driven {
        warn!(
            rows_read = progress.rows_read,
            checkpoint = progress.watermark,
            "job aborted mid-file"
        );
        return Err(fail_run(ctx, run_id, err).await);
    }
    progress.result.duration = started.elapsed();

    let extra = RunExtra {
        records_extracted: Some(progress.rows_read),
        metadata: Some(json!({
            "table": job.table,
            "url": job.url,
            "resumed_from": resumed_from,
            "checkpoint": progress.watermark,
            "batches_total": progress.result.batches_total,
            "batches_failed": progress.result.batches_failed,
            "rss_delta_bytes": rss_delta,
        })),
    };
    let run = ctx.tracker.finish(run_id, &progress.result, extra).await?;

    let checkpoint = if progress.result.status() == LoadStatus::Success {
        ctx.checkpoints.clear_async(&job.job_name).await?;
        0
    } else {
        warn!(
            checkpoint = progress.watermark,
            errors = progress.result.errors.len(),
            "keeping checkpoint for retry"
        );
        progress.watermark
    };

    Ok(JobReport {
        run,
        result: progress.result,
        resumed_from,
        rows_read: progress.rows_read,
        checkpoint,
    })
}

async fn drive_chunks(
    ctx: &IngestContext,
    job: &FileJob,
    path: PathBuf,
    transform: &(dyn Fn(Vec<Record>) -> Result<Vec<Record>> + Send + Sync),
    resumed_from: u64,
    progress: &mut ChunkLoop,
) -> Result<()> {
    let mut options = StreamOptions::new(ctx.config.stream.chunk_size)
        .start_row(resumed_from)
        .memory_guard(ctx.memory_guard);
    options.columns = job.columns.clone();

    let mut reader = Some(open_reader(path, options).await?);

    while let Some(current) = reader.take() {
        let (current, next) = next_chunk(current).await?;
        let Some(batch) = next.transpose()? else {
            break;
        };
        reader = Some(current);

        progress.rows_read += batch.len() as u64;
        let end_row = batch.end_row();
        let first_row = batch.first_row;

        let rows = transform(batch.rows)?;
        let chunk_result = ctx.sink.upsert(&job.table, &rows, &job.conflict_columns).await;
        let chunk_ok = chunk_result.records_failed == 0;
        progress.result.merge(chunk_result);

        match ctx.config.checkpoint.mode {
            CheckpointMode::Scanned => progress.watermark = end_row,
            CheckpointMode::Committed if progress.committed && chunk_ok => progress.watermark = end_row,
            CheckpointMode::Committed => {
                if progress.committed {
                    warn!(first_row, end_row, "chunk had failed batches, checkpoint frozen");
                }
                progress.committed = false;
            },
        }

        ctx.checkpoints.save_async(&job.job_name, progress.watermark).await?;
        info!(
            first_row,
            end_row,
            checkpoint = progress.watermark,
            loaded = progress.result.records_loaded,
            failed = progress.result.records_failed,
            "chunk processed"
        );
    }

    Ok(())
}

async fn open_reader(path: PathBuf, options: StreamOptions) -> Result<ChunkReader> {
    tokio::task::spawn_blocking(move || stream_chunks(Path::new(&path), &options)).await?
}

/// Read one chunk on a blocking thread, handing the reader back
async fn next_chunk(mut reader: ChunkReader) -> Result<(ChunkReader, Option<Result<RecordBatch>>)> {
    Ok(tokio::task::spawn_blocking(move || {
        let next = reader.next();
        (reader, next)
    })
    .await?)
}

async fn fail_run(ctx: &IngestContext, run_id: Uuid, err: IngestError) -> IngestError {
    if let Err(track_err) = ctx.tracker.fail(run_id, &err.to_string()).await {
        error!(run_id = %run_id, error = %track_err, "could not record run failure");
    }
    err
}

/// Run independent jobs concurrently; a failing job is logged and skipped
pub async fn run_jobs(ctx: &IngestContext, jobs: &[(FileJob, Transform)]) -> Vec<JobOutcome> {
    let outcomes = join_all(jobs.iter().map(|(job, transform)| async move {
        let result = run_file_job(ctx, job, transform.as_ref()).await;
        if let Err(err) = &result {
            error!(job = %job.job_name, error = %err, "job failed, continuing with remaining jobs");
        }
        JobOutcome {
            job_name: job.job_name.clone(),
            result,
        }
    }))
    .await;

    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    info!(jobs = outcomes.len(), succeeded, "all jobs finished");

    outcomes
}
