//! candata ingestion reliability layer
//!
//! Building blocks for loading large, periodically refreshed public
//! datasets from slow or quota-limited upstreams into a store that must not
//! accumulate duplicates:
//!
//! - [`retry`]: bounded exponential backoff around fallible calls
//! - [`rate_limit`]: per-second plus per-hour admission gate
//! - [`download`] and [`cache`]: resumable downloads with freshness-based reuse
//! - [`stream`] and [`memory`]: bounded-memory chunked CSV reading
//! - [`checkpoint`]: durable per-job resume offsets
//! - [`sink`]: batched idempotent upserts with per-batch failure isolation
//! - [`tracker`]: job run records
//! - [`source`] and [`job`]: orchestration of the pieces above
//!
//! # Example
//!
//! ```no_run
//! use candata_ingest::{config::IngestConfig, job, sink, tracker::JobRunTracker};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let target = Arc::new(sink::MemoryTarget::new());
//!     let sink = sink::BatchUpsertSink::from_config(target, &config.sink);
//!     let ctx = job::IngestContext::from_config(config, JobRunTracker::in_memory(), sink)?;
//!
//!     let cpi = job::FileJob {
//!         job_name: "statcan_cpi".into(),
//!         source_name: "StatCan".into(),
//!         url: "https://example.org/18100004.csv".into(),
//!         filename: None,
//!         table: "indicator_values".into(),
//!         conflict_columns: vec!["indicator_id".into(), "ref_date".into()],
//!         columns: None,
//!         metadata: serde_json::Value::Null,
//!     };
//!     let report = job::run_file_job(&ctx, &cpi, job::passthrough().as_ref()).await?;
//!     println!("{}", report.status());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod job;
pub mod memory;
pub mod rate_limit;
pub mod retry;
pub mod sink;
pub mod source;
pub mod stream;
pub mod tracker;

pub use error::{IngestError, Result};
