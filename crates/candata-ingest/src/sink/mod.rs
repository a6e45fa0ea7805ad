//! Batched, idempotent writes with per-batch failure isolation
//!
//! [`BatchUpsertSink`] splits records into batches bounded by row count and
//! approximate payload size, then hands each batch to an [`UpsertTarget`].
//! A batch that fails is counted and recorded in the [`LoadResult`]; the
//! remaining batches are still attempted. Writes are keyed upserts, so
//! replaying a batch after a crash never creates duplicates.

pub mod memory;
pub mod postgres;
pub mod rest;

pub use memory::MemoryTarget;
pub use postgres::PgUpsertTarget;
pub use rest::RestUpsertTarget;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};

use crate::config::{SinkConfig, DEFAULT_BATCH_SIZE, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::error::{IngestError, Result};
use crate::stream::Record;

/// Overall outcome of a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Success,
    PartialFailure,
    Failure,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Success => "success",
            LoadStatus::PartialFailure => "partial_failure",
            LoadStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts and errors from one or more sink calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub sink_name: String,
    pub records_loaded: u64,
    pub records_failed: u64,
    pub batches_total: u64,
    pub batches_failed: u64,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl LoadResult {
    pub fn new(sink_name: impl Into<String>) -> Self {
        Self {
            sink_name: sink_name.into(),
            ..Self::default()
        }
    }

    /// `success` when nothing failed, `partial_failure` when something
    /// failed and something loaded, `failure` otherwise
    pub fn status(&self) -> LoadStatus {
        if self.records_failed == 0 {
            LoadStatus::Success
        } else if self.records_loaded > 0 {
            LoadStatus::PartialFailure
        } else {
            LoadStatus::Failure
        }
    }

    /// Fold another result into this one
    pub fn merge(&mut self, other: LoadResult) {
        if self.sink_name.is_empty() {
            self.sink_name = other.sink_name;
        }
        self.records_loaded += other.records_loaded;
        self.records_failed += other.records_failed;
        self.batches_total += other.batches_total;
        self.batches_failed += other.batches_failed;
        self.errors.extend(other.errors);
        self.duration += other.duration;
    }
}

/// A store that can insert-or-update a batch keyed by conflict columns
#[async_trait]
pub trait UpsertTarget: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Write `rows` to `table`, updating rows whose `conflict_columns`
    /// already exist; all or nothing per call
    async fn upsert_batch(&self, table: &str, rows: &[Record], conflict_columns: &[String]) -> Result<()>;
}

#[derive(Clone)]
pub struct BatchUpsertSink {
    target: Arc<dyn UpsertTarget>,
    batch_size: usize,
    max_payload_bytes: usize,
    omit_nulls: bool,
    ignore_columns: HashSet<String>,
}

impl fmt::Debug for BatchUpsertSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchUpsertSink")
            .field("target", &self.target.name())
            .field("batch_size", &self.batch_size)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .field("omit_nulls", &self.omit_nulls)
            .field("ignore_columns", &self.ignore_columns)
            .finish()
    }
}

impl BatchUpsertSink {
    pub fn new(target: Arc<dyn UpsertTarget>) -> Self {
        Self::with_limits(target, DEFAULT_BATCH_SIZE, DEFAULT_MAX_PAYLOAD_BYTES)
    }

    pub fn from_config(target: Arc<dyn UpsertTarget>, config: &SinkConfig) -> Self {
        Self::with_limits(target, config.batch_size, config.max_payload_bytes)
            .omit_nulls(config.omit_nulls)
            .ignore_columns(config.ignore_columns.iter().cloned())
    }

    /// Nulls are sent as-is and no columns are ignored
    pub fn with_limits(target: Arc<dyn UpsertTarget>, batch_size: usize, max_payload_bytes: usize) -> Self {
        Self {
            target,
            batch_size: batch_size.max(1),
            max_payload_bytes: max_payload_bytes.max(1),
            omit_nulls: false,
            ignore_columns: HashSet::new(),
        }
    }

    /// Leave null fields out of the payload, so a new row gets the column
    /// default and an existing row keeps its value
    pub fn omit_nulls(mut self, omit: bool) -> Self {
        self.omit_nulls = omit;
        self
    }

    /// Columns stripped from every record before it is sent
    pub fn ignore_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn target_name(&self) -> &str {
        self.target.name()
    }

    /// Upsert `records` into `sink_name` and report what happened
    ///
    /// Never returns an error: failures are accounted per batch in the
    /// result so the caller can decide between success, partial failure and
    /// failure.
    #[instrument(skip(self, records, conflict_columns), fields(target = self.target.name(), records = records.len()))]
    pub async fn upsert(&self, sink_name: &str, records: &[Record], conflict_columns: &[String]) -> LoadResult {
        let started = Instant::now();
        let mut result = LoadResult::new(sink_name);

        if records.is_empty() {
            debug!(sink_name, "nothing to upsert");
            return result;
        }

        let records = self.prepare(records);
        let records: &[Record] = &records;
        let batches = self.plan_batches(records);
        let total = batches.len();
        result.batches_total = total as u64;

        for (idx, range) in batches.into_iter().enumerate() {
            let batch = &records[range.clone()];
            let number = idx + 1;

            let outcome = match missing_conflict_column(batch, conflict_columns) {
                Some(column) => Err(IngestError::MissingConflictColumn(column.to_string())),
                None => self.target.upsert_batch(sink_name, batch, conflict_columns).await,
            };

            match outcome {
                Ok(()) => {
                    result.records_loaded += batch.len() as u64;
                    debug!(sink_name, batch = number, of = total, rows = batch.len(), "batch upserted");
                },
                Err(err) => {
                    error!(
                        sink_name,
                        batch = number,
                        of = total,
                        rows = batch.len(),
                        first_row = range.start,
                        error = %err,
                        "batch upsert failed"
                    );
                    result.records_failed += batch.len() as u64;
                    result.batches_failed += 1;
                    result.errors.push(format!("batch {number}/{total}: {err}"));
                },
            }
        }

        result.duration = started.elapsed();
        info!(
            sink_name,
            loaded = result.records_loaded,
            failed = result.records_failed,
            batches = result.batches_total,
            batches_failed = result.batches_failed,
            duration_ms = result.duration.as_millis() as u64,
            status = %result.status(),
            "upsert finished"
        );

        result
    }

    /// Apply null omission and ignored columns; borrows when neither is set
    fn prepare<'a>(&self, records: &'a [Record]) -> Cow<'a, [Record]> {
        if !self.omit_nulls && self.ignore_columns.is_empty() {
            return Cow::Borrowed(records);
        }

        Cow::Owned(
            records
                .iter()
                .map(|record| {
                    record
                        .iter()
                        .filter(|(column, value)| {
                            !(self.omit_nulls && value.is_null()) && !self.ignore_columns.contains(column.as_str())
                        })
                        .map(|(column, value)| (column.clone(), value.clone()))
                        .collect()
                })
                .collect(),
        )
    }

    /// Split into ranges of at most `batch_size` rows and roughly
    /// `max_payload_bytes` of JSON; an oversized row stands alone
    fn plan_batches(&self, records: &[Record]) -> Vec<Range<usize>> {
        let mut batches = Vec::new();
        let mut start = 0;
        let mut payload = 0usize;

        for (idx, record) in records.iter().enumerate() {
            let size = serde_json::to_vec(record).map_or(0, |bytes| bytes.len()) + 1;
            let rows = idx - start;

            if rows > 0 && (rows >= self.batch_size || payload + size > self.max_payload_bytes) {
                batches.push(start..idx);
                start = idx;
                payload = 0;
            }
            payload += size;
        }
        batches.push(start..records.len());

        batches
    }
}

/// First conflict column absent (or null) in any row of the batch
fn missing_conflict_column<'a>(rows: &[Record], conflict_columns: &'a [String]) -> Option<&'a str> {
    conflict_columns
        .iter()
        .find(|column| {
            rows.iter()
                .any(|row| matches!(row.get(column.as_str()), None | Some(Value::Null)))
        })
        .map(String::as_str)
}

/// Values of `conflict_columns` in `row`, used to identify duplicates
pub(crate) fn conflict_key(row: &Record, conflict_columns: &[String]) -> Vec<String> {
    conflict_columns
        .iter()
        .map(|column| row.get(column).map(Value::to_string).unwrap_or_default())
        .collect()
}
