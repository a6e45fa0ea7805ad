//! Bounded-memory CSV streaming
//!
//! [`stream_chunks`] turns a delimited file of any size into a lazy sequence
//! of [`RecordBatch`]es, holding at most one batch of materialized records
//! at a time. A non-zero `start_row` skips already-processed rows without
//! decoding them, so resuming a half-loaded file costs a scan, not a parse.

use csv::{ByteRecord, ReaderBuilder, StringRecord};
use futures::Stream;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::{IngestError, Result};
use crate::memory::MemoryGuard;

/// One row, keyed by column name
pub type Record = serde_json::Map<String, Value>;

/// Lines sampled by [`estimate_rows`]
const ESTIMATE_SAMPLE_LINES: usize = 1000;

/// Chunks between progress log lines
const PROGRESS_EVERY_CHUNKS: u64 = 10;

/// A contiguous run of rows from the source file
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    /// Zero-based data row index of `rows[0]`
    pub first_row: u64,
    pub rows: Vec<Record>,
}

impl RecordBatch {
    /// Index one past the last row of this batch
    pub fn end_row(&self) -> u64 {
        self.first_row + self.rows.len() as u64
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub chunk_size: usize,
    /// Only materialize these columns; `None` keeps all
    pub columns: Option<Vec<String>>,
    /// Data rows to skip before the first batch
    pub start_row: u64,
    pub delimiter: u8,
    pub has_headers: bool,
    pub memory_guard: MemoryGuard,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::config::DEFAULT_CHUNK_SIZE,
            columns: None,
            start_row: 0,
            delimiter: b',',
            has_headers: true,
            memory_guard: MemoryGuard::default(),
        }
    }
}

impl StreamOptions {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn start_row(mut self, start_row: u64) -> Self {
        self.start_row = start_row;
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn has_headers(mut self, has_headers: bool) -> Self {
        self.has_headers = has_headers;
        self
    }

    pub fn memory_guard(mut self, guard: MemoryGuard) -> Self {
        self.memory_guard = guard;
        self
    }
}

/// Open `path` for chunked reading
///
/// Fails with [`IngestError::OutOfMemory`] before touching the file when the
/// host is below the guard's hard floor, and with
/// [`IngestError::UnknownColumn`] when a projected column is not in the
/// header.
#[instrument(skip(path, options), fields(path = %path.display(), start_row = options.start_row))]
pub fn stream_chunks(path: &Path, options: &StreamOptions) -> Result<ChunkReader> {
    options.memory_guard.check()?;

    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(options.has_headers)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let header = if options.has_headers {
        reader.headers()?.clone()
    } else {
        StringRecord::new()
    };

    let fields = resolve_fields(&header, options.columns.as_deref())?;
    let mut chunks = ChunkReader {
        reader,
        fields,
        chunk_size: options.chunk_size.max(1),
        next_row: 0,
        chunks_read: 0,
        record: StringRecord::new(),
        done: false,
    };

    chunks.skip_rows(options.start_row)?;
    debug!(columns = chunks.fields.len(), "stream opened");

    Ok(chunks)
}

/// Column name and field index pairs to materialize
///
/// Headerless input has no names to resolve against, so projected columns
/// must then use the positional `column_<n>` form.
fn resolve_fields(header: &StringRecord, columns: Option<&[String]>) -> Result<Vec<(String, usize)>> {
    let position = |name: &str| -> Option<usize> {
        if header.is_empty() {
            name.strip_prefix("column_")?.parse().ok()
        } else {
            header.iter().position(|h| h == name)
        }
    };

    match columns {
        None => Ok(header
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.to_string(), idx))
            .collect()),
        Some(wanted) => wanted
            .iter()
            .map(|name| {
                position(name)
                    .map(|idx| (name.clone(), idx))
                    .ok_or_else(|| IngestError::UnknownColumn(name.clone()))
            })
            .collect(),
    }
}

/// Lazy, finite iterator of record batches over one open file
///
/// Not restartable: call [`stream_chunks`] again to re-read from the start.
pub struct ChunkReader {
    reader: csv::Reader<BufReader<File>>,
    fields: Vec<(String, usize)>,
    chunk_size: usize,
    next_row: u64,
    chunks_read: u64,
    record: StringRecord,
    done: bool,
}

impl std::fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkReader")
            .field("chunk_size", &self.chunk_size)
            .field("next_row", &self.next_row)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl ChunkReader {
    /// Data row index of the next row to be read
    pub fn position(&self) -> u64 {
        self.next_row
    }

    /// Advance past `count` rows without decoding them
    fn skip_rows(&mut self, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let mut raw = ByteRecord::new();
        while self.next_row < count {
            if !self.reader.read_byte_record(&mut raw)? {
                warn!(
                    requested = count,
                    available = self.next_row,
                    "start row is past the end of the file"
                );
                self.done = true;
                break;
            }
            self.next_row += 1;
        }

        info!(skipped = self.next_row, "resumed from checkpoint");
        Ok(())
    }

    fn materialize(&self) -> Record {
        let mut row = Record::with_capacity(self.fields.len());
        if self.fields.is_empty() {
            // Headerless input without projection keeps every field positionally
            for (idx, field) in self.record.iter().enumerate() {
                row.insert(format!("column_{idx}"), field_value(Some(field)));
            }
            return row;
        }
        for (name, idx) in &self.fields {
            row.insert(name.clone(), field_value(self.record.get(*idx)));
        }
        row
    }

    fn read_chunk(&mut self) -> Result<Option<RecordBatch>> {
        let first_row = self.next_row;
        let mut rows = Vec::with_capacity(self.chunk_size);

        while rows.len() < self.chunk_size {
            if !self.reader.read_record(&mut self.record)? {
                self.done = true;
                break;
            }
            rows.push(self.materialize());
            self.next_row += 1;
        }

        if rows.is_empty() {
            info!(total_rows = self.next_row, chunks = self.chunks_read, "finished reading file");
            return Ok(None);
        }

        self.chunks_read += 1;
        if self.chunks_read % PROGRESS_EVERY_CHUNKS == 0 {
            info!(rows_read = self.next_row, chunks = self.chunks_read, "streaming progress");
        }

        Ok(Some(RecordBatch { first_row, rows }))
    }

    /// Drive the reader on a blocking thread, forwarding batches through a
    /// channel of `capacity` slots
    ///
    /// Dropping the returned stream stops the reader at its next send.
    pub fn into_stream(self, capacity: usize) -> impl Stream<Item = Result<RecordBatch>> + Send + 'static {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        tokio::task::spawn_blocking(move || {
            for batch in self {
                if tx.blocking_send(batch).is_err() {
                    debug!("stream receiver dropped, stopping reader");
                    break;
                }
            }
        });

        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|batch| (batch, rx)) })
    }
}

impl Iterator for ChunkReader {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_chunk() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(err) => {
                self.done = true;
                Some(Err(err))
            },
        }
    }
}

fn field_value(field: Option<&str>) -> Value {
    match field {
        None | Some("") => Value::Null,
        Some(text) => Value::String(text.to_string()),
    }
}

/// Estimate data rows from the average length of the first lines
///
/// Assumes one header line. Cheap enough to call before deciding chunk
/// sizes or showing progress.
pub fn estimate_rows(path: &Path) -> Result<u64> {
    let file_size = std::fs::metadata(path)?.len();
    let mut reader = BufReader::new(File::open(path)?);

    let mut sample_bytes = 0u64;
    let mut sample_lines = 0u64;
    let mut line = Vec::new();
    while sample_lines <= ESTIMATE_SAMPLE_LINES as u64 {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        sample_bytes += read as u64;
        sample_lines += 1;
    }

    if sample_lines <= 1 {
        return Ok(0);
    }

    let avg = sample_bytes as f64 / sample_lines as f64;
    let estimated = ((file_size as f64 / avg) as u64).saturating_sub(1);
    debug!(path = %path.display(), estimated, "estimated rows");
    Ok(estimated)
}
