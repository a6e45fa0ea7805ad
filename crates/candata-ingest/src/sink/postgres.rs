//! Direct Postgres upserts
//!
//! A batch is sent as one JSONB array and expanded server side with
//! `jsonb_populate_recordset`, so one statement writes the whole batch and
//! column types come from the target table rather than from the client.
//! Rows are grouped by the set of keys they carry and each group gets its own
//! column list, so a key a row leaves out falls back to the column default
//! (or keeps the stored value on update) instead of being written as NULL.
//! The groups of one batch share a transaction.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use super::{conflict_key, UpsertTarget};
use crate::db::quote_ident;
use crate::error::Result;
use crate::stream::Record;

#[derive(Debug, Clone)]
pub struct PgUpsertTarget {
    pool: PgPool,
}

impl PgUpsertTarget {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UpsertTarget for PgUpsertTarget {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn upsert_batch(&self, table: &str, rows: &[Record], conflict_columns: &[String]) -> Result<()> {
        let rows = dedupe_last_wins(rows, conflict_columns);
        let groups = group_by_columns(&rows);

        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for (columns, group) in &groups {
            let sql = upsert_sql(table, columns, conflict_columns);
            affected += sqlx::query(&sql).bind(Json(group)).execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        debug!(table, rows = rows.len(), statements = groups.len(), affected, "postgres upsert");
        Ok(())
    }
}

/// Rows keyed by their sorted column names, in first-seen group order
fn group_by_columns<'a>(rows: &[&'a Record]) -> Vec<(Vec<&'a str>, Vec<&'a Record>)> {
    let mut slot_of: BTreeMap<Vec<&str>, usize> = BTreeMap::new();
    let mut groups: Vec<(Vec<&str>, Vec<&Record>)> = Vec::new();

    for &row in rows {
        let mut columns: Vec<&str> = row.keys().map(String::as_str).collect();
        columns.sort_unstable();
        match slot_of.get(&columns) {
            Some(&slot) => groups[slot].1.push(row),
            None => {
                slot_of.insert(columns.clone(), groups.len());
                groups.push((columns, vec![row]));
            },
        }
    }
    groups
}

/// Keep only the last row for each conflict key, in first-seen order
///
/// `ON CONFLICT DO UPDATE` refuses to touch the same row twice in one
/// statement.
fn dedupe_last_wins<'a>(rows: &'a [Record], conflict_columns: &[String]) -> Vec<&'a Record> {
    let mut slot_of: HashMap<Vec<String>, usize> = HashMap::with_capacity(rows.len());
    let mut kept: Vec<&Record> = Vec::with_capacity(rows.len());

    for row in rows {
        let key = conflict_key(row, conflict_columns);
        match slot_of.get(&key) {
            Some(&slot) => kept[slot] = row,
            None => {
                slot_of.insert(key, kept.len());
                kept.push(row);
            },
        }
    }
    kept
}

fn upsert_sql(table: &str, columns: &[&str], conflict_columns: &[String]) -> String {
    let table = quote_ident(table);
    let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let key_list = conflict_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !conflict_columns.iter().any(|k| k == *c))
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
        .collect();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {table} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1) \
         ON CONFLICT ({key_list}) {action}"
    )
}
