//! Ingestion configuration
//!
//! Every knob the reliability layer recognizes is listed here as a typed
//! field with a documented default. Values are read from `CANDATA_*`
//! environment variables (after `.env` is loaded) and validated once at
//! startup; components receive plain values, never the environment.

use candata_common::env::{optional, parse_or, string_or};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::memory::MemoryGuard;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

// ============================================================================
// Defaults
// ============================================================================

/// Default cache directory for downloaded bulk files.
pub const DEFAULT_CACHE_DIR: &str = "./data/cache";

/// Default freshness window for cached files (hours).
pub const DEFAULT_CACHE_MAX_AGE_HOURS: f64 = 24.0;

/// Default download attempts before giving up.
pub const DEFAULT_DOWNLOAD_MAX_ATTEMPTS: u32 = 5;

/// Default fixed wait between download attempts (seconds).
pub const DEFAULT_DOWNLOAD_RETRY_WAIT_SECS: u64 = 10;

/// Default time allowed to establish a download connection (seconds).
pub const DEFAULT_DOWNLOAD_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default idle timeout between body reads of a download (seconds).
pub const DEFAULT_DOWNLOAD_READ_TIMEOUT_SECS: u64 = 300;

/// Default rows per streamed chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// Default hard memory floor (MiB).
pub const DEFAULT_MEMORY_HARD_FLOOR_MB: u64 = 512;

/// Default recommended available memory (MiB).
pub const DEFAULT_MEMORY_RECOMMENDED_MB: u64 = 1024;

/// Default retry attempts for API calls.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Default first backoff delay (milliseconds).
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Default backoff ceiling (milliseconds).
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Default per-second API ceiling.
pub const DEFAULT_RATE_PER_SECOND: u32 = 1;

/// Default per-hour API ceiling.
pub const DEFAULT_RATE_PER_HOUR: u32 = 500;

/// Default rows per upsert request.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default approximate payload ceiling per upsert request (bytes).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// Default checkpoint file.
pub const DEFAULT_CHECKPOINT_FILE: &str = "./data/cache/checkpoints.json";

/// Default Postgres pool size.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// What a saved checkpoint offset means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Offset of the last row before which every row was loaded
    #[default]
    Committed,
    /// Offset of the last row read from the source, loaded or not
    Scanned,
}

impl std::str::FromStr for CheckpointMode {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "committed" => Ok(CheckpointMode::Committed),
            "scanned" | "read" => Ok(CheckpointMode::Scanned),
            other => Err(IngestError::config(format!("unknown checkpoint mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_age_hours: f64,
}

/// Hours as a [`Duration`]; negative counts as zero and values too large to
/// represent (including infinity) saturate to [`Duration::MAX`]
pub fn duration_from_hours(hours: f64) -> Duration {
    Duration::try_from_secs_f64(hours.max(0.0) * 3600.0).unwrap_or(Duration::MAX)
}

fn mib_to_bytes(mib: u64) -> u64 {
    mib.saturating_mul(1024 * 1024)
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        duration_from_hours(self.max_age_hours)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub max_attempts: u32,
    pub retry_wait_secs: u64,
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated while a body is streaming
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub hard_floor_mb: u64,
    pub recommended_mb: u64,
}

impl MemoryConfig {
    pub fn guard(&self) -> MemoryGuard {
        MemoryGuard::new(mib_to_bytes(self.hard_floor_mb), mib_to_bytes(self.recommended_mb))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub per_hour: u32,
}

impl RateLimitConfig {
    pub fn limiter(&self) -> RateLimiter {
        RateLimiter::new(self.per_second, self.per_hour)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub batch_size: usize,
    pub max_payload_bytes: usize,
    /// Drop null fields so the store's column defaults apply
    pub omit_nulls: bool,
    /// Columns never sent to the store
    pub ignore_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub file: PathBuf,
    pub mode: CheckpointMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
}

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub cache: CacheConfig,
    pub download: DownloadConfig,
    pub stream: StreamConfig,
    pub memory: MemoryConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub sink: SinkConfig,
    pub checkpoint: CheckpointConfig,
    pub database: DatabaseConfig,
    pub rest: RestConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig {
                dir: PathBuf::from(DEFAULT_CACHE_DIR),
                max_age_hours: DEFAULT_CACHE_MAX_AGE_HOURS,
            },
            download: DownloadConfig {
                max_attempts: DEFAULT_DOWNLOAD_MAX_ATTEMPTS,
                retry_wait_secs: DEFAULT_DOWNLOAD_RETRY_WAIT_SECS,
                connect_timeout_secs: DEFAULT_DOWNLOAD_CONNECT_TIMEOUT_SECS,
                read_timeout_secs: DEFAULT_DOWNLOAD_READ_TIMEOUT_SECS,
            },
            stream: StreamConfig {
                chunk_size: DEFAULT_CHUNK_SIZE,
            },
            memory: MemoryConfig {
                hard_floor_mb: DEFAULT_MEMORY_HARD_FLOOR_MB,
                recommended_mb: DEFAULT_MEMORY_RECOMMENDED_MB,
            },
            retry: RetryConfig {
                max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
                base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
                max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            },
            rate_limit: RateLimitConfig {
                per_second: DEFAULT_RATE_PER_SECOND,
                per_hour: DEFAULT_RATE_PER_HOUR,
            },
            sink: SinkConfig {
                batch_size: DEFAULT_BATCH_SIZE,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                omit_nulls: true,
                ignore_columns: Vec::new(),
            },
            checkpoint: CheckpointConfig {
                file: PathBuf::from(DEFAULT_CHECKPOINT_FILE),
                mode: CheckpointMode::default(),
            },
            database: DatabaseConfig {
                url: None,
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            },
            rest: RestConfig {
                url: None,
                api_key: None,
            },
        }
    }
}

impl IngestConfig {
    /// Load configuration from `.env` and the process environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            cache: CacheConfig {
                dir: PathBuf::from(string_or("CANDATA_CACHE_DIR", DEFAULT_CACHE_DIR)),
                max_age_hours: parse_or("CANDATA_CACHE_MAX_AGE_HOURS", DEFAULT_CACHE_MAX_AGE_HOURS)?,
            },
            download: DownloadConfig {
                max_attempts: parse_or("CANDATA_DOWNLOAD_MAX_ATTEMPTS", DEFAULT_DOWNLOAD_MAX_ATTEMPTS)?,
                retry_wait_secs: parse_or(
                    "CANDATA_DOWNLOAD_RETRY_WAIT_SECS",
                    DEFAULT_DOWNLOAD_RETRY_WAIT_SECS,
                )?,
                connect_timeout_secs: parse_or(
                    "CANDATA_DOWNLOAD_CONNECT_TIMEOUT_SECS",
                    DEFAULT_DOWNLOAD_CONNECT_TIMEOUT_SECS,
                )?,
                read_timeout_secs: parse_or(
                    "CANDATA_DOWNLOAD_READ_TIMEOUT_SECS",
                    DEFAULT_DOWNLOAD_READ_TIMEOUT_SECS,
                )?,
            },
            stream: StreamConfig {
                chunk_size: parse_or("CANDATA_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            },
            memory: MemoryConfig {
                hard_floor_mb: parse_or("CANDATA_MEMORY_HARD_FLOOR_MB", DEFAULT_MEMORY_HARD_FLOOR_MB)?,
                recommended_mb: parse_or(
                    "CANDATA_MEMORY_RECOMMENDED_MB",
                    DEFAULT_MEMORY_RECOMMENDED_MB,
                )?,
            },
            retry: RetryConfig {
                max_attempts: parse_or("CANDATA_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS)?,
                base_delay_ms: parse_or("CANDATA_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?,
                max_delay_ms: parse_or("CANDATA_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS)?,
            },
            rate_limit: RateLimitConfig {
                per_second: parse_or("CANDATA_RATE_PER_SECOND", DEFAULT_RATE_PER_SECOND)?,
                per_hour: parse_or("CANDATA_RATE_PER_HOUR", DEFAULT_RATE_PER_HOUR)?,
            },
            sink: SinkConfig {
                batch_size: parse_or("CANDATA_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
                max_payload_bytes: parse_or("CANDATA_MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD_BYTES)?,
                omit_nulls: parse_or("CANDATA_SINK_OMIT_NULLS", true)?,
                ignore_columns: optional("CANDATA_SINK_IGNORE_COLUMNS")
                    .map(|list| {
                        list.split(',')
                            .map(str::trim)
                            .filter(|column| !column.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            checkpoint: CheckpointConfig {
                file: PathBuf::from(string_or("CANDATA_CHECKPOINT_FILE", DEFAULT_CHECKPOINT_FILE)),
                mode: string_or("CANDATA_CHECKPOINT_MODE", "committed").parse()?,
            },
            database: DatabaseConfig {
                url: optional("DATABASE_URL"),
                max_connections: parse_or(
                    "CANDATA_DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
            },
            rest: RestConfig {
                url: optional("CANDATA_REST_URL"),
                api_key: optional("CANDATA_REST_KEY"),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.cache.max_age_hours.is_finite() || self.cache.max_age_hours < 0.0 {
            return Err(IngestError::config("cache max age must be a non-negative number of hours"));
        }

        if self.download.max_attempts == 0 {
            return Err(IngestError::config("download max_attempts must be greater than 0"));
        }

        if self.download.connect_timeout_secs == 0 || self.download.read_timeout_secs == 0 {
            return Err(IngestError::config("download timeouts must be greater than 0"));
        }

        if self.stream.chunk_size == 0 {
            return Err(IngestError::config("chunk_size must be greater than 0"));
        }

        if self.memory.hard_floor_mb > self.memory.recommended_mb {
            return Err(IngestError::config(format!(
                "memory hard floor ({} MB) cannot exceed the recommended amount ({} MB)",
                self.memory.hard_floor_mb, self.memory.recommended_mb
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(IngestError::config("retry max_attempts must be greater than 0"));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(IngestError::config(format!(
                "retry base delay ({} ms) cannot exceed max delay ({} ms)",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }

        if self.rate_limit.per_second == 0 || self.rate_limit.per_hour == 0 {
            return Err(IngestError::config("rate limits must be greater than 0"));
        }

        if self.rate_limit.per_second > self.rate_limit.per_hour {
            return Err(IngestError::config("per-second limit cannot exceed per-hour limit"));
        }

        if self.sink.batch_size == 0 || self.sink.max_payload_bytes == 0 {
            return Err(IngestError::config("sink batch size and payload ceiling must be greater than 0"));
        }

        if self.database.max_connections == 0 {
            return Err(IngestError::config("database max_connections must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sink.batch_size, 500);
        assert_eq!(config.cache.max_age(), Duration::from_secs(24 * 3600));
        assert_eq!(config.retry.policy().max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_inverted_retry_delays() {
        let mut config = IngestConfig::default();
        config.retry.base_delay_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_memory_floors() {
        let mut config = IngestConfig::default();
        config.memory.hard_floor_mb = 4096;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let mut config = IngestConfig::default();
        config.stream.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checkpoint_mode_parse() {
        assert_eq!("Committed".parse::<CheckpointMode>().unwrap(), CheckpointMode::Committed);
        assert_eq!("read".parse::<CheckpointMode>().unwrap(), CheckpointMode::Scanned);
        assert!("sometimes".parse::<CheckpointMode>().is_err());
    }

    #[test]
    fn test_memory_guard_conversion() {
        let guard = MemoryConfig {
            hard_floor_mb: 512,
            recommended_mb: 1024,
        }
        .guard();
        assert_eq!(guard.hard_floor_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn test_huge_memory_floors_saturate() {
        let guard = MemoryConfig {
            hard_floor_mb: u64::MAX,
            recommended_mb: u64::MAX / 2,
        }
        .guard();
        assert_eq!(guard.hard_floor_bytes, u64::MAX);
        assert_eq!(guard.recommended_bytes, u64::MAX);
    }

    #[test]
    fn test_duration_from_hours_never_panics() {
        assert_eq!(duration_from_hours(2.0), Duration::from_secs(7200));
        assert_eq!(duration_from_hours(-5.0), Duration::ZERO);
        assert_eq!(duration_from_hours(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_hours(f64::INFINITY), Duration::MAX);
        assert_eq!(duration_from_hours(1e300), Duration::MAX);
    }

    #[test]
    fn test_sink_defaults_omit_nulls() {
        let config = IngestConfig::default();
        assert!(config.sink.omit_nulls);
        assert!(config.sink.ignore_columns.is_empty());
    }
}
