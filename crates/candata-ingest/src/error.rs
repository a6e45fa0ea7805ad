//! Error taxonomy for the ingestion layer
//!
//! Errors fall into four groups that callers treat differently:
//!
//! - transient transport failures, retried with bounded attempts
//!   ([`IngestError::is_transient`])
//! - terminal client errors such as 401/403, never retried
//! - resource exhaustion ([`IngestError::OutOfMemory`]), fatal at once
//! - per-batch write errors, which the sink folds into a `LoadResult`
//!   instead of returning

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::tracker::RunStatus;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("HTTP {status} from {url}: credentials rejected")]
    Unauthorized { status: u16, url: String },

    #[error("Rate limited by remote (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(
        "Only {:.2}GB RAM available (floor {:.2}GB), aborting to prevent OOM",
        gib(.available_bytes),
        gib(.floor_bytes)
    )]
    OutOfMemory { available_bytes: u64, floor_bytes: u64 },

    #[error("Gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Checkpoint for '{job}' would move backwards ({current} -> {requested})")]
    CheckpointRegression { job: String, current: u64, requested: u64 },

    #[error("Column '{0}' not found in file header")]
    UnknownColumn(String),

    #[error("Record is missing conflict column '{0}'")]
    MissingConflictColumn(String),

    #[error("Pipeline run {0} not found")]
    RunNotFound(Uuid),

    #[error("Pipeline run {run_id} is {from}, cannot move to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error(transparent)]
    Common(#[from] candata_common::CandataError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn gib(bytes: &u64) -> f64 {
    *bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

impl IngestError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform(message.into())
    }

    /// Map a non-success HTTP status to the matching error class
    pub fn from_status(status: reqwest::StatusCode, url: &str, retry_after: Option<Duration>) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Unauthorized {
                status: status.as_u16(),
                url: url.to_string(),
            },
            429 => Self::RateLimited { retry_after },
            code => Self::Http {
                status: code,
                url: url.to_string(),
            },
        }
    }

    /// Whether a retry has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
                    || e.status().is_some_and(|s| s.is_server_error())
            },
            Self::Http { status, .. } => *status >= 500,
            Self::RateLimited { .. } => true,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Server-supplied delay before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Innermost error, looking through `RetryExhausted` wrappers
    pub fn root(&self) -> &IngestError {
        match self {
            Self::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Parse a `Retry-After` header given in seconds
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
