//! Resumable HTTP downloads
//!
//! Large bulk files are streamed to `<dest>.part` and renamed onto `dest`
//! only once the body is complete, so `dest` never holds a truncated file.
//! If a previous attempt left a partial file behind, the next request asks
//! for the remaining bytes with `Range: bytes=<size>-` and appends them. A
//! server that ignores `Range` and answers `200` gets the partial file
//! discarded and rewritten from zero, so the result is never a corrupted
//! concatenation. An existing `dest` is never resumed from: it is replaced
//! whole.
//!
//! The client has no whole-request timeout. Connecting is bounded, and a
//! body read that stalls longer than the read timeout fails the attempt;
//! a slow but steady transfer may take as long as it needs.
//!
//! Attempts are retried a fixed number of times with a fixed wait rather
//! than exponential backoff: downloads are long-lived, and a short constant
//! pause suits them better.

use async_trait::async_trait;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use crate::config::DownloadConfig;
use crate::error::{parse_retry_after, IngestError, Result};

/// Write buffer for streamed bodies
const WRITE_BUFFER_BYTES: usize = 256 * 1024;

/// Anything that can materialize a remote resource at a local path
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf>;
}

/// HTTP downloader with byte-range resume
#[derive(Debug, Clone)]
pub struct ResumableDownloader {
    client: Client,
    max_attempts: u32,
    retry_wait: Duration,
    show_progress: bool,
}

impl ResumableDownloader {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(concat!("candata-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(
            client,
            config.max_attempts,
            Duration::from_secs(config.retry_wait_secs),
        ))
    }

    pub fn with_client(client: Client, max_attempts: u32, retry_wait: Duration) -> Self {
        Self {
            client,
            max_attempts: max_attempts.max(1),
            retry_wait,
            show_progress: true,
        }
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Download `url` to `dest`, resuming `<dest>.part` when possible
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    pub async fn download(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part = partial_path(dest);
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match self.attempt(url, &part).await {
                Ok(size) => {
                    promote(&part, dest).await?;
                    info!(bytes = size, attempt, "download complete");
                    return Ok(dest.to_path_buf());
                },
                Err(err) if !worth_retrying(&err) => {
                    warn!(error = %err, attempt, "download failed with terminal error");
                    return Err(err);
                },
                Err(err) => {
                    if attempt < self.max_attempts {
                        warn!(
                            attempt,
                            max_attempts = self.max_attempts,
                            wait_s = self.retry_wait.as_secs(),
                            error = %err,
                            "download attempt failed, retrying"
                        );
                        tokio::time::sleep(self.retry_wait).await;
                    }
                    last_error = Some(err);
                },
            }
        }

        Err(IngestError::RetryExhausted {
            attempts: self.max_attempts,
            source: Box::new(last_error.unwrap_or_else(|| {
                IngestError::Http {
                    status: 0,
                    url: url.to_string(),
                }
            })),
        })
    }

    /// Download and then verify the file against an expected SHA-256
    ///
    /// A mismatching file is removed so the next call starts clean.
    pub async fn download_verified(&self, url: &str, dest: &Path, sha256: &str) -> Result<PathBuf> {
        let path = self.download(url, dest).await?;

        let check_path = path.clone();
        let expected = sha256.to_string();
        let verified =
            tokio::task::spawn_blocking(move || candata_common::checksum::verify_sha256_file(&check_path, &expected))
                .await?;

        if let Err(err) = verified {
            warn!(error = %err, path = %path.display(), "checksum mismatch, discarding download");
            tokio::fs::remove_file(&path).await.ok();
            return Err(err.into());
        }

        Ok(path)
    }

    /// One request into the partial file; returns its final size
    async fn attempt(&self, url: &str, part: &Path) -> Result<u64> {
        let existing = existing_size(part).await?;

        let mut request = self.client.get(url);
        if existing > 0 {
            info!(resume_from_mb = existing as f64 / 1_048_576.0, "resuming download");
            request = request.header(RANGE, format!("bytes={existing}-"));
        } else {
            debug!("starting fresh download");
        }

        let response = request.send().await?;
        let status = response.status();

        let (file, offset) = match status {
            StatusCode::PARTIAL_CONTENT => {
                if let Some(start) = content_range_start(response.headers()) {
                    if start != existing {
                        tokio::fs::remove_file(part).await.ok();
                        return Err(IngestError::Io(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("server resumed at byte {start}, expected {existing}"),
                        )));
                    }
                }
                let file = OpenOptions::new().create(true).append(true).open(part).await?;
                (file, existing)
            },
            StatusCode::OK => {
                if existing > 0 {
                    warn!(discarded_bytes = existing, "server ignored Range header, restarting from zero");
                }
                (tokio::fs::File::create(part).await?, 0)
            },
            StatusCode::RANGE_NOT_SATISFIABLE => {
                if content_range_total(response.headers()) == Some(existing) {
                    debug!(bytes = existing, "partial file already complete");
                    return Ok(existing);
                }
                warn!(bytes = existing, "range not satisfiable, discarding partial file");
                tokio::fs::remove_file(part).await.ok();
                return Err(IngestError::Http {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            },
            other => {
                return Err(IngestError::from_status(
                    other,
                    url,
                    parse_retry_after(response.headers()),
                ))
            },
        };

        let total = response.content_length().map(|len| len + offset);
        let progress = self.progress_bar(total, offset, part);

        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);
        let mut written = offset;
        let mut body = response.bytes_stream();

        let streamed = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                writer.write_all(&chunk).await?;
                written += chunk.len() as u64;
                progress.set_position(written);
            }
            Ok::<(), IngestError>(())
        }
        .await;

        // Keep whatever arrived so the next attempt can resume from it
        writer.flush().await?;
        streamed?;

        if let Some(expected) = total {
            if written < expected {
                return Err(IngestError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("body ended after {written} of {expected} bytes"),
                )));
            }
        }

        writer.get_ref().sync_all().await?;
        progress.finish_and_clear();

        Ok(written)
    }

    fn progress_bar(&self, total: Option<u64>, position: u64, dest: &Path) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let bar = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(
            dest.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        bar.set_position(position);
        bar
    }
}

#[async_trait]
impl Fetcher for ResumableDownloader {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        self.download(url, dest).await
    }
}

/// `<dest>.part`, next to `dest`
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Move a finished partial file onto `dest` and stamp it as freshly fetched
async fn promote(part: &Path, dest: &Path) -> Result<()> {
    tokio::fs::rename(part, dest).await?;

    // A resumed or 416-confirmed file keeps its old mtime otherwise
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&dest)?
            .set_modified(SystemTime::now())
    })
    .await??;
    Ok(())
}

fn worth_retrying(err: &IngestError) -> bool {
    err.is_transient() || matches!(err, IngestError::Http { status: 416, .. })
}

async fn existing_size(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

/// `bytes START-END/TOTAL` -> START
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes ")?;
    range.split('-').next()?.trim().parse().ok()
}

/// `bytes */TOTAL` or `bytes START-END/TOTAL` -> TOTAL
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    value.rsplit('/').next()?.trim().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_content_range_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 100-199/200"));
        assert_eq!(content_range_start(&headers), Some(100));
        assert_eq!(content_range_total(&headers), Some(200));

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes */4096"));
        assert_eq!(content_range_start(&headers), None);
        assert_eq!(content_range_total(&headers), Some(4096));

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-9/*"));
        assert_eq!(content_range_total(&headers), None);
    }

    #[test]
    fn test_partial_path_sits_next_to_dest() {
        assert_eq!(
            partial_path(Path::new("/cache/abc-data.csv")),
            PathBuf::from("/cache/abc-data.csv.part")
        );
    }

    #[test]
    fn test_range_not_satisfiable_is_retried() {
        assert!(worth_retrying(&IngestError::Http {
            status: 416,
            url: String::new()
        }));
        assert!(!worth_retrying(&IngestError::Http {
            status: 404,
            url: String::new()
        }));
    }
}
