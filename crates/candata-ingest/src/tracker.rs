//! Job run bookkeeping
//!
//! Every ingestion run gets a record that moves through
//! `pending -> running -> {success | partial_failure | failure}` and never
//! changes after reaching a terminal state. A run is `pending` while its
//! inputs are being prepared (for file jobs, while the file is fetched), and
//! may fail straight from there. Records live behind the
//! [`RunStore`] trait: [`PgRunStore`] writes the `pipeline_runs` table, and
//! [`MemoryRunStore`] keeps them in process for dry runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::postgres::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::sink::{LoadResult, LoadStatus};

/// Longest error message kept on a run record
pub const MAX_ERROR_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    PartialFailure,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failure => "failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::PartialFailure | RunStatus::Failure)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial_failure" => Ok(RunStatus::PartialFailure),
            "failure" => Ok(RunStatus::Failure),
            other => Err(IngestError::config(format!("unknown run status '{other}'"))),
        }
    }
}

impl From<LoadStatus> for RunStatus {
    fn from(status: LoadStatus) -> Self {
        match status {
            LoadStatus::Success => RunStatus::Success,
            LoadStatus::PartialFailure => RunStatus::PartialFailure,
            LoadStatus::Failure => RunStatus::Failure,
        }
    }
}

/// One execution of an ingestion job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_name: String,
    pub source_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_extracted: Option<u64>,
    pub records_loaded: u64,
    pub records_rejected: u64,
    pub error_message: Option<String>,
    pub metadata: Value,
}

/// Extra facts recorded when a run finishes
#[derive(Debug, Clone, Default)]
pub struct RunExtra {
    pub records_extracted: Option<u64>,
    /// Merged into the run's metadata object
    pub metadata: Option<Value>,
}

/// Persistence for run records
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert(&self, run: &JobRun) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<JobRun>>;

    /// Move a `pending` run to `running`; returns `false` when the stored
    /// run is not pending
    async fn mark_running(&self, id: Uuid) -> Result<bool>;

    /// Replace a run that is not yet terminal; returns `false` when the
    /// stored run already finished
    async fn complete(&self, run: &JobRun) -> Result<bool>;

    /// Newest first
    async fn recent(&self, limit: usize) -> Result<Vec<JobRun>>;
}

/// Creates and closes run records
#[derive(Clone)]
pub struct JobRunTracker {
    store: Arc<dyn RunStore>,
}

impl fmt::Debug for JobRunTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunTracker").finish_non_exhaustive()
    }
}

impl JobRunTracker {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Tracker backed by a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRunStore::default()))
    }

    /// Record a new `running` run
    pub async fn start(&self, job_name: &str, source_name: &str, metadata: Value) -> Result<Uuid> {
        let run_id = self.register(job_name, source_name, metadata).await?;
        self.begin(run_id).await?;
        Ok(run_id)
    }

    /// Record a new `pending` run for work that is being prepared
    #[instrument(skip(self, metadata))]
    pub async fn register(&self, job_name: &str, source_name: &str, metadata: Value) -> Result<Uuid> {
        let run = JobRun {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            source_name: source_name.to_string(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            records_extracted: None,
            records_loaded: 0,
            records_rejected: 0,
            error_message: None,
            metadata: object_or_empty(metadata),
        };

        self.store.insert(&run).await?;
        debug!(run_id = %run.id, job_name, source_name, "job run registered");
        Ok(run.id)
    }

    /// Move a pending run to `running`
    #[instrument(skip(self))]
    pub async fn begin(&self, run_id: Uuid) -> Result<()> {
        if self.store.mark_running(run_id).await? {
            info!(run_id = %run_id, "job run started");
            return Ok(());
        }
        let current = self.get(run_id).await?;
        Err(IngestError::InvalidTransition {
            run_id,
            from: current.status,
            to: RunStatus::Running,
        })
    }

    /// Close a run with the outcome of its load
    #[instrument(skip(self, result, extra))]
    pub async fn finish(&self, run_id: Uuid, result: &LoadResult, extra: RunExtra) -> Result<JobRun> {
        let mut run = self.running(run_id, result.status().into()).await?;
        let completed_at = Utc::now();
        let elapsed_ms = (completed_at - run.started_at).num_milliseconds().max(0);

        let mut metadata = match run.metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(Value::Object(extra_meta)) = extra.metadata {
            metadata.extend(extra_meta);
        }
        metadata.insert("duration_ms".to_string(), json!(elapsed_ms));
        if !result.errors.is_empty() {
            metadata.insert("batch_errors".to_string(), json!(result.errors));
        }

        run.status = result.status().into();
        run.completed_at = Some(completed_at);
        run.records_loaded = result.records_loaded;
        run.records_rejected = result.records_failed;
        if extra.records_extracted.is_some() {
            run.records_extracted = extra.records_extracted;
        }
        run.metadata = Value::Object(metadata);

        self.complete(&run).await?;

        match run.status {
            RunStatus::Success => info!(
                run_id = %run_id,
                job_name = %run.job_name,
                records_loaded = run.records_loaded,
                duration_ms = elapsed_ms,
                "job run finished"
            ),
            status => warn!(
                run_id = %run_id,
                job_name = %run.job_name,
                %status,
                records_loaded = run.records_loaded,
                records_rejected = run.records_rejected,
                duration_ms = elapsed_ms,
                "job run finished with failures"
            ),
        }

        Ok(run)
    }

    /// Close a run that could not produce a load result
    #[instrument(skip(self, message))]
    pub async fn fail(&self, run_id: Uuid, message: &str) -> Result<JobRun> {
        let mut run = self.get(run_id).await?;
        if run.status.is_terminal() {
            return Err(IngestError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::Failure,
            });
        }
        run.status = RunStatus::Failure;
        run.completed_at = Some(Utc::now());
        run.error_message = Some(truncate_chars(message, MAX_ERROR_MESSAGE_CHARS).to_string());

        self.complete(&run).await?;
        error!(run_id = %run_id, job_name = %run.job_name, error = message, "job run failed");
        Ok(run)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<JobRun> {
        self.store.get(run_id).await?.ok_or(IngestError::RunNotFound(run_id))
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<JobRun>> {
        self.store.recent(limit).await
    }

    /// Fetch a run, insisting that it is still running
    async fn running(&self, run_id: Uuid, to: RunStatus) -> Result<JobRun> {
        let run = self.get(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(IngestError::InvalidTransition {
                run_id,
                from: run.status,
                to,
            });
        }
        Ok(run)
    }

    async fn complete(&self, run: &JobRun) -> Result<()> {
        if self.store.complete(run).await? {
            return Ok(());
        }
        // Lost a race with another writer closing the same run
        let current = self.get(run.id).await?;
        Err(IngestError::InvalidTransition {
            run_id: run.id,
            from: current.status,
            to: run.status,
        })
    }
}

fn object_or_empty(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        Value::Null => Value::Object(Map::new()),
        other => json!({ "value": other }),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<Uuid, JobRun>>,
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, run: &JobRun) -> Result<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn mark_running(&self, id: Uuid) -> Result<bool> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&id) {
            Some(stored) if stored.status == RunStatus::Pending => {
                stored.status = RunStatus::Running;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn complete(&self, run: &JobRun) -> Result<bool> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&run.id) {
            Some(stored) if !stored.status.is_terminal() => {
                *stored = run.clone();
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn recent(&self, limit: usize) -> Result<Vec<JobRun>> {
        let runs = self.runs.read().await;
        let mut all: Vec<JobRun> = runs.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        Ok(all)
    }
}

// ============================================================================
// Postgres store
// ============================================================================

const CREATE_PIPELINE_RUNS: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id                UUID PRIMARY KEY,
    pipeline_name     TEXT NOT NULL,
    source_name       TEXT NOT NULL,
    status            TEXT NOT NULL,
    started_at        TIMESTAMPTZ NOT NULL,
    completed_at      TIMESTAMPTZ,
    records_extracted BIGINT,
    records_loaded    BIGINT NOT NULL DEFAULT 0,
    records_rejected  BIGINT NOT NULL DEFAULT 0,
    error_message     TEXT,
    metadata          JSONB NOT NULL DEFAULT '{}'::jsonb
)
"#;

const CREATE_PIPELINE_RUNS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS pipeline_runs_started_at_idx ON pipeline_runs (started_at DESC)";

/// Run records in the `pipeline_runs` table
#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    pipeline_name: String,
    source_name: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    records_extracted: Option<i64>,
    records_loaded: i64,
    records_rejected: i64,
    error_message: Option<String>,
    metadata: Value,
}

impl TryFrom<RunRow> for JobRun {
    type Error = IngestError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(JobRun {
            id: row.id,
            job_name: row.pipeline_name,
            source_name: row.source_name,
            status: row.status.parse()?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            records_extracted: row.records_extracted.map(to_u64),
            records_loaded: to_u64(row.records_loaded),
            records_rejected: to_u64(row.records_rejected),
            error_message: row.error_message,
            metadata: row.metadata,
        })
    }
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

const SELECT_RUN: &str = "SELECT id, pipeline_name, source_name, status, started_at, completed_at, \
     records_extracted, records_loaded, records_rejected, error_message, metadata FROM pipeline_runs";

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `pipeline_runs` table if it does not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_PIPELINE_RUNS).execute(&self.pool).await?;
        sqlx::query(CREATE_PIPELINE_RUNS_INDEX).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn insert(&self, run: &JobRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (
                id, pipeline_name, source_name, status, started_at, completed_at,
                records_extracted, records_loaded, records_rejected, error_message, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.id)
        .bind(&run.job_name)
        .bind(&run.source_name)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.records_extracted.map(to_i64))
        .bind(to_i64(run.records_loaded))
        .bind(to_i64(run.records_rejected))
        .bind(&run.error_message)
        .bind(&run.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRun>> {
        let row: Option<RunRow> = sqlx::query_as(&format!("{SELECT_RUN} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRun::try_from).transpose()
    }

    async fn mark_running(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE pipeline_runs SET status = 'running' WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, run: &JobRun) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $2,
                completed_at = $3,
                records_extracted = $4,
                records_loaded = $5,
                records_rejected = $6,
                error_message = $7,
                metadata = $8
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.completed_at)
        .bind(run.records_extracted.map(to_i64))
        .bind(to_i64(run.records_loaded))
        .bind(to_i64(run.records_rejected))
        .bind(&run.error_message)
        .bind(&run.metadata)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<JobRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!("{SELECT_RUN} ORDER BY started_at DESC LIMIT $1"))
            .bind(to_i64(limit as u64))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRun::try_from).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loaded(loaded: u64, failed: u64) -> LoadResult {
        LoadResult {
            sink_name: "cpi".into(),
            records_loaded: loaded,
            records_failed: failed,
            batches_total: 2,
            batches_failed: u64::from(failed > 0),
            errors: if failed > 0 { vec!["batch 2/2: boom".into()] } else { vec![] },
            duration: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_start_then_finish_success() {
        let tracker = JobRunTracker::in_memory();
        let id = tracker.start("statcan_cpi", "StatCan", json!({"table": "cpi"})).await.unwrap();
        assert_eq!(tracker.get(id).await.unwrap().status, RunStatus::Running);

        let run = tracker
            .finish(
                id,
                &loaded(100, 0),
                RunExtra {
                    records_extracted: Some(100),
                    metadata: Some(json!({"file": "cpi.csv"})),
                },
            )
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.records_loaded, 100);
        assert_eq!(run.records_extracted, Some(100));
        assert!(run.completed_at.is_some());
        assert_eq!(run.metadata["table"], json!("cpi"));
        assert_eq!(run.metadata["file"], json!("cpi.csv"));
        assert!(run.metadata["duration_ms"].is_number());
    }

    #[tokio::test]
    async fn test_finish_maps_partial_and_total_failure() {
        let tracker = JobRunTracker::in_memory();

        let partial = tracker.start("a", "s", Value::Null).await.unwrap();
        let run = tracker.finish(partial, &loaded(10, 5), RunExtra::default()).await.unwrap();
        assert_eq!(run.status, RunStatus::PartialFailure);
        assert_eq!(run.records_rejected, 5);

        let failed = tracker.start("b", "s", Value::Null).await.unwrap();
        let run = tracker.finish(failed, &loaded(0, 5), RunExtra::default()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_terminal_runs_cannot_transition() {
        let tracker = JobRunTracker::in_memory();
        let id = tracker.start("a", "s", Value::Null).await.unwrap();
        tracker.fail(id, "network down").await.unwrap();

        let err = tracker.finish(id, &loaded(1, 0), RunExtra::default()).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::InvalidTransition {
                from: RunStatus::Failure,
                to: RunStatus::Success,
                ..
            }
        ));
        assert!(tracker.fail(id, "again").await.is_err());
    }

    #[tokio::test]
    async fn test_registered_run_is_pending_until_begun() {
        let tracker = JobRunTracker::in_memory();
        let id = tracker.register("a", "s", Value::Null).await.unwrap();
        assert_eq!(tracker.get(id).await.unwrap().status, RunStatus::Pending);

        let err = tracker.finish(id, &loaded(1, 0), RunExtra::default()).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::InvalidTransition {
                from: RunStatus::Pending,
                ..
            }
        ));

        tracker.begin(id).await.unwrap();
        assert_eq!(tracker.get(id).await.unwrap().status, RunStatus::Running);
        assert!(matches!(
            tracker.begin(id).await.unwrap_err(),
            IngestError::InvalidTransition {
                from: RunStatus::Running,
                to: RunStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pending_run_can_fail_directly() {
        let tracker = JobRunTracker::in_memory();
        let id = tracker.register("a", "s", Value::Null).await.unwrap();

        let run = tracker.fail(id, "download failed").await.unwrap();
        assert_eq!(run.status, RunStatus::Failure);
        assert!(tracker.begin(id).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let tracker = JobRunTracker::in_memory();
        let err = tracker.fail(Uuid::new_v4(), "x").await.unwrap_err();
        assert!(matches!(err, IngestError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_fail_truncates_on_char_boundary() {
        let tracker = JobRunTracker::in_memory();
        let id = tracker.start("a", "s", Value::Null).await.unwrap();
        let message = "é".repeat(3000);

        let run = tracker.fail(id, &message).await.unwrap();
        let stored = run.error_message.unwrap();
        assert_eq!(stored.chars().count(), MAX_ERROR_MESSAGE_CHARS);
        assert_eq!(run.status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let tracker = JobRunTracker::in_memory();
        let first = tracker.start("a", "s", Value::Null).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = tracker.start("b", "s", Value::Null).await.unwrap();

        let runs = tracker.recent(10).await.unwrap();
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(tracker.recent(1).await.unwrap().len(), 1);
    }

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::PartialFailure,
            RunStatus::Failure,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::PartialFailure.is_terminal());
    }
}
