//! Durable per-job resume offsets
//!
//! All jobs share one JSON file mapping job name to the number of source
//! rows already processed. Every read-modify-write holds an exclusive lock
//! on a sidecar `<file>.lock`, and writes go through a temporary file in the
//! same directory that is fsynced and renamed over the original, so a crash
//! leaves either the old table or the new one, never a torn file.

use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};

type Table = BTreeMap<String, u64>;

/// File-backed checkpoint table
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Exclusive lock released on drop
struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.0) {
            warn!(error = %err, "failed to release checkpoint lock");
        }
    }
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that `rows` source rows of `job` are processed
    ///
    /// Moving an existing offset backwards is refused; use [`clear`](Self::clear)
    /// to restart a job from zero.
    pub fn save(&self, job: &str, rows: u64) -> Result<()> {
        let _lock = self.lock()?;
        let mut table = self.read_table();

        let current = table.get(job).copied().unwrap_or(0);
        if rows < current {
            return Err(IngestError::CheckpointRegression {
                job: job.to_string(),
                current,
                requested: rows,
            });
        }
        if rows == current && table.contains_key(job) {
            return Ok(());
        }

        table.insert(job.to_string(), rows);
        self.write_table(&table)?;
        debug!(job, rows, "checkpoint saved");
        Ok(())
    }

    /// Rows already processed for `job`; 0 when none recorded
    pub fn load(&self, job: &str) -> Result<u64> {
        let _lock = self.lock()?;
        Ok(self.read_table().get(job).copied().unwrap_or(0))
    }

    /// Forget `job`'s offset, typically after a clean run
    pub fn clear(&self, job: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut table = self.read_table();
        if table.remove(job).is_some() {
            self.write_table(&table)?;
            info!(job, "checkpoint cleared");
        }
        Ok(())
    }

    /// Snapshot of every recorded offset
    pub fn entries(&self) -> Result<BTreeMap<String, u64>> {
        let _lock = self.lock()?;
        Ok(self.read_table())
    }

    pub async fn save_async(&self, job: &str, rows: u64) -> Result<()> {
        let store = self.clone();
        let job = job.to_string();
        tokio::task::spawn_blocking(move || store.save(&job, rows)).await?
    }

    pub async fn load_async(&self, job: &str) -> Result<u64> {
        let store = self.clone();
        let job = job.to_string();
        tokio::task::spawn_blocking(move || store.load(&job)).await?
    }

    pub async fn clear_async(&self, job: &str) -> Result<()> {
        let store = self.clone();
        let job = job.to_string();
        tokio::task::spawn_blocking(move || store.clear(&job)).await?
    }

    pub async fn entries_async(&self) -> Result<BTreeMap<String, u64>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.entries()).await?
    }

    fn lock(&self) -> Result<LockGuard> {
        if let Some(parent) = self.lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(LockGuard(file))
    }

    /// Current table; a missing file is empty, a corrupt one is logged and
    /// treated as empty
    fn read_table(&self) -> Table {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Table::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "checkpoint file unreadable, starting fresh");
                return Table::new();
            },
        };

        match serde_json::from_slice(&bytes) {
            Ok(table) => table,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "checkpoint file corrupt, starting fresh");
                Table::new()
            },
        }
    }

    fn write_table(&self, table: &Table) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, table)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| IngestError::Io(err.error))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path().join("checkpoints.json"))
    }

    #[test]
    fn test_load_defaults_to_zero() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store(&dir).load("never").unwrap(), 0);
    }

    #[test]
    fn test_last_save_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let first = store(&dir);
        first.save("cpi", 1000).unwrap();
        first.save("cpi", 2000).unwrap();
        first.save("gdp", 50).unwrap();
        drop(first);

        let reopened = store(&dir);
        assert_eq!(reopened.load("cpi").unwrap(), 2000);
        assert_eq!(reopened.load("gdp").unwrap(), 50);

        let on_disk: Table = serde_json::from_slice(&std::fs::read(reopened.path()).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 2);
    }

    #[test]
    fn test_backwards_save_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save("cpi", 500).unwrap();

        let err = store.save("cpi", 100).unwrap_err();
        assert!(matches!(
            err,
            IngestError::CheckpointRegression {
                current: 500,
                requested: 100,
                ..
            }
        ));
        assert_eq!(store.load("cpi").unwrap(), 500);
    }

    #[test]
    fn test_clear_resets_and_keeps_others() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save("a", 10).unwrap();
        store.save("b", 20).unwrap();

        store.clear("a").unwrap();
        store.clear("missing").unwrap();

        assert_eq!(store.load("a").unwrap(), 0);
        assert_eq!(store.entries().unwrap().into_iter().collect::<Vec<_>>(), vec![("b".to_string(), 20)]);

        // A cleared job may start over from a lower offset
        store.save("a", 3).unwrap();
    }

    #[test]
    fn test_corrupt_file_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::write(store.path(), b"{ not json").unwrap();

        assert_eq!(store.load("cpi").unwrap(), 0);
        store.save("cpi", 7).unwrap();
        assert_eq!(store.load("cpi").unwrap(), 7);
    }

    #[test]
    fn test_parent_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("deep/nested/cp.json"));
        store.save("x", 1).unwrap();
        assert_eq!(store.load("x").unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_jobs_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir));

        let mut handles = Vec::new();
        for job in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("job-{job}");
                for rows in 1..=20u64 {
                    store.save_async(&name, rows * 100).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = store.entries_async().await.unwrap();
        assert_eq!(entries.len(), 8);
        assert!(entries.values().all(|rows| *rows == 2000));
    }
}
