//! End-to-end behavior of the reliability layer
//!
//! - idempotent upserts
//! - partial-failure aggregation
//! - crash and resume of a file job
//! - a full job fed by the HTTP downloader

use async_trait::async_trait;
use candata_ingest::cache::DiskCache;
use candata_ingest::checkpoint::CheckpointStore;
use candata_ingest::config::IngestConfig;
use candata_ingest::download::{Fetcher, ResumableDownloader};
use candata_ingest::error::{IngestError, Result};
use candata_ingest::job::{passthrough, run_file_job, FileJob, IngestContext};
use candata_ingest::memory::MemoryGuard;
use candata_ingest::sink::{BatchUpsertSink, LoadStatus, MemoryTarget};
use candata_ingest::stream::Record;
use candata_ingest::tracker::{JobRunTracker, RunStatus};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

struct LocalFile {
    source: PathBuf,
    fetches: AtomicUsize,
}

#[async_trait]
impl Fetcher for LocalFile {
    async fn fetch(&self, _url: &str, dest: &Path) -> Result<PathBuf> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(&self.source, dest).await?;
        Ok(dest.to_path_buf())
    }
}

fn write_csv(path: &Path, rows: usize) {
    let mut file = std::fs::File::create(path).unwrap();
    writeln!(file, "geo,ref_date,value").unwrap();
    for i in 0..rows {
        writeln!(file, "G{},{},{}", i % 100, i / 100, i).unwrap();
    }
}

fn records(n: usize, value: &str) -> Vec<Record> {
    (0..n)
        .map(|i| {
            json!({"id": i.to_string(), "value": value})
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect()
}

fn context(dir: &TempDir, fetcher: Arc<dyn Fetcher>, target: Arc<MemoryTarget>, chunk_size: usize) -> IngestContext {
    let mut config = IngestConfig::default();
    config.stream.chunk_size = chunk_size;

    IngestContext::new(
        config,
        DiskCache::new(dir.path().join("cache"), fetcher),
        CheckpointStore::new(dir.path().join("checkpoints.json")),
        JobRunTracker::in_memory(),
        BatchUpsertSink::with_limits(target, 250, usize::MAX),
    )
    .with_memory_guard(MemoryGuard::disabled())
}

fn file_job() -> FileJob {
    FileJob {
        job_name: "statcan_cpi".into(),
        source_name: "StatCan".into(),
        url: "https://example.invalid/cpi.csv".into(),
        filename: Some("cpi.csv".into()),
        table: "indicator_values".into(),
        conflict_columns: vec!["geo".into(), "ref_date".into()],
        columns: None,
        metadata: json!({"frequency": "monthly"}),
    }
}

#[tokio::test]
async fn test_upsert_twice_is_idempotent() {
    let target = Arc::new(MemoryTarget::new());
    let sink = BatchUpsertSink::with_limits(target.clone(), 100, usize::MAX);
    let keys = vec!["id".to_string()];

    let first = sink.upsert("t", &records(300, "old"), &keys).await;
    let second = sink.upsert("t", &records(300, "new"), &keys).await;

    assert_eq!(first.status(), LoadStatus::Success);
    assert_eq!(second.records_loaded, 300);
    assert_eq!(target.len("t"), 300);
    assert!(target.rows("t").iter().all(|row| row["value"] == json!("new")));
}

#[tokio::test]
async fn test_partial_failure_is_aggregated() {
    let target = Arc::new(MemoryTarget::new().fail_calls([3]));
    let sink = BatchUpsertSink::with_limits(target.clone(), 100, usize::MAX);

    let result = sink.upsert("t", &records(1000, "v"), &["id".to_string()]).await;

    assert_eq!(result.records_loaded, 900);
    assert_eq!(result.records_failed, 100);
    assert_eq!(result.batches_failed, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.status(), LoadStatus::PartialFailure);
    assert_eq!(target.len("t"), 900);
}

#[tokio::test]
async fn test_crashed_job_resumes_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.csv");
    write_csv(&source, 10_000);

    let fetcher = Arc::new(LocalFile {
        source,
        fetches: AtomicUsize::new(0),
    });
    let target = Arc::new(MemoryTarget::new());
    let ctx = context(&dir, fetcher.clone(), target.clone(), 1000);

    // First run dies on the sixth chunk
    let chunks = AtomicUsize::new(0);
    let crash_on_sixth = move |rows: Vec<Record>| {
        if chunks.fetch_add(1, Ordering::SeqCst) == 5 {
            Err(IngestError::transform("simulated crash"))
        } else {
            Ok(rows)
        }
    };
    let err = run_file_job(&ctx, &file_job(), &crash_on_sixth).await.unwrap_err();
    assert!(matches!(err, IngestError::Transform(_)));
    assert_eq!(ctx.checkpoints.load("statcan_cpi").unwrap(), 5000);
    assert_eq!(target.len("indicator_values"), 5000);

    // Second run picks up where the first stopped
    let report = run_file_job(&ctx, &file_job(), passthrough().as_ref()).await.unwrap();

    assert_eq!(report.resumed_from, 5000);
    assert_eq!(report.rows_read, 5000);
    assert_eq!(report.status(), LoadStatus::Success);
    assert_eq!(report.run.status, RunStatus::Success);
    assert_eq!(report.run.metadata["resumed_from"], json!(5000));
    assert_eq!(report.run.metadata["frequency"], json!("monthly"));
    assert_eq!(target.len("indicator_values"), 10_000);
    assert_eq!(ctx.checkpoints.load("statcan_cpi").unwrap(), 0);

    // The cached download was reused
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

    let runs = ctx.tracker.recent(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].status, RunStatus::Failure);
}

#[tokio::test]
async fn test_unknown_projection_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.csv");
    write_csv(&source, 10);

    let fetcher = Arc::new(LocalFile {
        source,
        fetches: AtomicUsize::new(0),
    });
    let ctx = context(&dir, fetcher, Arc::new(MemoryTarget::new()), 100);

    let mut job = file_job();
    job.columns = Some(vec!["geo".into(), "no_such_column".into()]);

    let err = run_file_job(&ctx, &job, passthrough().as_ref()).await.unwrap_err();
    assert!(matches!(err, IngestError::UnknownColumn(_)));

    let run = &ctx.tracker.recent(1).await.unwrap()[0];
    assert_eq!(run.status, RunStatus::Failure);
}

#[tokio::test]
async fn test_job_downloads_over_http() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let body = "geo,ref_date,value\nCA,2024-01,1.5\nON,2024-01,2.5\nCA,2024-01,1.7\n";
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let downloader = ResumableDownloader::with_client(reqwest::Client::new(), 2, Duration::from_millis(10))
        .show_progress(false);
    let target = Arc::new(MemoryTarget::new());
    let ctx = context(&dir, Arc::new(downloader), target.clone(), 100);

    let mut job = file_job();
    job.url = format!("{}/cpi.csv", server.uri());
    job.metadata = Value::Null;

    let report = run_file_job(&ctx, &job, passthrough().as_ref()).await.unwrap();

    assert_eq!(report.rows_read, 3);
    // The repeated CA row collapses onto one key with the later value
    assert_eq!(target.len("indicator_values"), 2);
    let ca = target
        .rows("indicator_values")
        .into_iter()
        .find(|row| row["geo"] == json!("CA"))
        .unwrap();
    assert_eq!(ca["value"], json!("1.7"));
}
