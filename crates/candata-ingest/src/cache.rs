//! Disk cache for downloaded bulk files
//!
//! A cached file is reused while its modification time is younger than the
//! caller's `max_age`; otherwise it is fetched again. Staleness is the only
//! eviction trigger. The fetcher is expected to publish complete files only
//! (the HTTP downloader stages bodies in `<name>.part`), so anything found at
//! the cache path is a whole file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument};

use crate::download::Fetcher;
use crate::error::Result;

/// Hex characters of the URL hash used in derived file names
const HASH_PREFIX_LEN: usize = 12;

/// Cache manager backed by a single directory
#[derive(Clone)]
pub struct DiskCache {
    cache_dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl DiskCache {
    /// The directory is created on first download, not here
    pub fn new(cache_dir: impl Into<PathBuf>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            fetcher,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path a resource would be cached at
    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.cache_dir.join(filename)
    }

    /// Return the cached file if fresh, otherwise download it first
    #[instrument(skip(self), fields(cache_dir = %self.cache_dir.display()))]
    pub async fn get_or_download(&self, url: &str, filename: &str, max_age: Duration) -> Result<PathBuf> {
        let path = self.path_for(filename);

        if let Some(age) = age_of(&path).await? {
            if age < max_age {
                info!(
                    filename,
                    age_hours = age.as_secs_f64() / 3600.0,
                    "using cached file"
                );
                return Ok(path);
            }
            debug!(filename, age_hours = age.as_secs_f64() / 3600.0, "cached file is stale");
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        info!(url, filename, "downloading");
        self.fetcher.fetch(url, &path).await
    }

    /// Deterministic file name for a URL: `<hash prefix>-<last segment>`
    pub fn cache_filename(url: &str) -> String {
        let hash = candata_common::checksum::sha256_hex(url);
        let without_query = url.split(['?', '#']).next().unwrap_or(url);
        let without_scheme = without_query
            .split_once("://")
            .map_or(without_query, |(_, rest)| rest);
        let path = without_scheme.split_once('/').map_or("", |(_, path)| path);
        let stem = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("download");

        format!("{}-{}", &hash[..HASH_PREFIX_LEN], stem)
    }
}

/// Age of a file from its modification time, `None` if it does not exist
///
/// A modification time in the future counts as age zero.
pub async fn age_of(path: &Path) -> Result<Option<Duration>> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let modified = meta.modified()?;
    Ok(Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    ))
}
