//! Pluggable data sources
//!
//! A [`Source`] knows how to pull raw rows from one upstream and normalize
//! them. [`run_source`] drives any source through extract and transform with
//! uniform timing and logging, so individual sources only carry their own
//! parsing logic.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tracing::{error, info, Instrument};

use crate::error::Result;
use crate::stream::Record;

#[async_trait]
pub trait Source: Send + Sync {
    /// Stable identifier used in logs and run records
    fn name(&self) -> &str;

    /// Pull raw rows from the upstream
    async fn extract(&self, params: &Value) -> Result<Vec<Record>>;

    /// Normalize raw rows into the target shape
    fn transform(&self, raw: Vec<Record>) -> Result<Vec<Record>>;

    /// Descriptive facts about the source, stored on run records
    async fn metadata(&self) -> Value {
        Value::Object(Default::default())
    }
}

/// Extract then transform, logging timing and failures of each phase
pub async fn run_source<S>(source: &S, params: &Value) -> Result<Vec<Record>>
where
    S: Source + ?Sized,
{
    let span = tracing::info_span!("source", name = source.name());

    async {
        let started = Instant::now();
        let raw = source.extract(params).await.map_err(|err| {
            error!(error = %err, "extract failed");
            err
        })?;
        let extract_ms = started.elapsed().as_millis() as u64;
        info!(rows = raw.len(), duration_ms = extract_ms, "extract complete");

        let started = Instant::now();
        let rows = source.transform(raw).map_err(|err| {
            error!(error = %err, "transform failed");
            err
        })?;
        info!(
            rows = rows.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "transform complete"
        );

        Ok(rows)
    }
    .instrument(span)
    .await
}
