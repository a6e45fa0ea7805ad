//! In-process upsert target for dry runs and tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{conflict_key, UpsertTarget};
use crate::error::{IngestError, Result};
use crate::stream::Record;

type Table = BTreeMap<Vec<String>, Record>;

/// Keyed tables held in memory
///
/// Upserting a row whose conflict key already exists replaces it, so the
/// table behaves like a database table with a unique constraint.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    tables: Mutex<HashMap<String, Table>>,
    calls: AtomicUsize,
    fail_calls: HashSet<usize>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the given 1-based calls fail, to simulate a flaky store
    pub fn fail_calls(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.fail_calls.extend(calls);
        self
    }

    /// Batches received so far, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Distinct keys stored in `table`
    pub fn len(&self, table: &str) -> usize {
        self.tables().get(table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Stored rows of `table`, ordered by key
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl UpsertTarget for MemoryTarget {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert_batch(&self, table: &str, rows: &[Record], conflict_columns: &[String]) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_calls.contains(&call) {
            return Err(IngestError::Http {
                status: 500,
                url: format!("memory://{table}"),
            });
        }

        let mut tables = self.tables();
        let stored = tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = conflict_key(row, conflict_columns);
            match stored.get_mut(&key) {
                Some(existing) => existing.extend(row.clone()),
                None => {
                    stored.insert(key, row.clone());
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_same_key_updates_in_place() {
        let target = MemoryTarget::new();
        let keys = vec!["geo".to_string(), "date".to_string()];

        target
            .upsert_batch(
                "cpi",
                &[record(json!({"geo": "CA", "date": "2024-01", "value": "1.0"}))],
                &keys,
            )
            .await
            .unwrap();
        target
            .upsert_batch(
                "cpi",
                &[record(json!({"geo": "CA", "date": "2024-01", "value": "2.0", "note": "rev"}))],
                &keys,
            )
            .await
            .unwrap();

        let rows = target.rows("cpi");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["value"], json!("2.0"));
        assert_eq!(rows[0]["note"], json!("rev"));
    }

    #[tokio::test]
    async fn test_configured_call_fails() {
        let target = MemoryTarget::new().fail_calls([2]);
        let keys = vec!["id".to_string()];
        let batch = [record(json!({"id": "1"}))];

        assert!(target.upsert_batch("t", &batch, &keys).await.is_ok());
        assert!(target.upsert_batch("t", &batch, &keys).await.is_err());
        assert!(target.upsert_batch("t", &batch, &keys).await.is_ok());
        assert_eq!(target.calls(), 3);
    }
}
