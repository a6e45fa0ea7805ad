//! Available-memory guard and process memory tracking
//!
//! The guard is checked before a large file is streamed so that a job fails
//! fast instead of pushing the host into swap or getting OOM-killed halfway
//! through. [`RssWatch`] logs how much resident memory a stretch of work
//! added, which is how a chunk size that is too large shows up.

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// Below this much available RAM streaming is refused
pub const DEFAULT_HARD_FLOOR_BYTES: u64 = GIB / 2;

/// Below this much available RAM a warning is logged
pub const DEFAULT_RECOMMENDED_BYTES: u64 = GIB;

/// Result of a memory check that did not abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    Ok { available_bytes: u64 },
    Low { available_bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryGuard {
    pub hard_floor_bytes: u64,
    pub recommended_bytes: u64,
}

impl Default for MemoryGuard {
    fn default() -> Self {
        Self {
            hard_floor_bytes: DEFAULT_HARD_FLOOR_BYTES,
            recommended_bytes: DEFAULT_RECOMMENDED_BYTES,
        }
    }
}

impl MemoryGuard {
    pub fn new(hard_floor_bytes: u64, recommended_bytes: u64) -> Self {
        Self {
            hard_floor_bytes,
            recommended_bytes,
        }
    }

    /// Disabled guard, for hosts where the reading is meaningless
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Read the host and evaluate
    pub fn check(&self) -> Result<MemoryStatus> {
        if self.hard_floor_bytes == 0 && self.recommended_bytes == 0 {
            return Ok(MemoryStatus::Ok { available_bytes: u64::MAX });
        }
        self.evaluate(available_memory())
    }

    /// Evaluate a given available-memory reading
    pub fn evaluate(&self, available_bytes: u64) -> Result<MemoryStatus> {
        if available_bytes < self.hard_floor_bytes {
            return Err(IngestError::OutOfMemory {
                available_bytes,
                floor_bytes: self.hard_floor_bytes,
            });
        }

        if available_bytes < self.recommended_bytes {
            warn!(
                available_gb = available_bytes as f64 / GIB as f64,
                recommended_gb = self.recommended_bytes as f64 / GIB as f64,
                "low available memory"
            );
            return Ok(MemoryStatus::Low { available_bytes });
        }

        debug!(available_gb = available_bytes as f64 / GIB as f64, "memory check passed");
        Ok(MemoryStatus::Ok { available_bytes })
    }
}

/// Currently available system RAM in bytes
pub fn available_memory() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

/// Resident set size of this process in bytes, if the platform reports it
pub fn process_rss() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        false,
        ProcessRefreshKind::nothing().with_memory(),
    );
    sys.process(pid).map(|process| process.memory())
}

/// Records RSS at the start of an operation and logs the change at the end
#[derive(Debug)]
pub struct RssWatch {
    label: String,
    before: Option<u64>,
}

impl RssWatch {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        let before = process_rss();
        debug!(label = %label, rss_mb = before.map(mib), "memory before");
        Self { label, before }
    }

    /// Log before/after/delta and return the delta in bytes
    pub fn finish(self) -> Option<i64> {
        let after = process_rss();
        let delta = rss_delta(self.before, after);
        info!(
            label = %self.label,
            before_mb = self.before.map(mib),
            after_mb = after.map(mib),
            delta_mb = delta.map(|bytes| bytes as f64 / MIB as f64),
            "memory usage"
        );
        delta
    }
}

const MIB: u64 = 1024 * 1024;

fn mib(bytes: u64) -> f64 {
    bytes as f64 / MIB as f64
}

fn rss_delta(before: Option<u64>, after: Option<u64>) -> Option<i64> {
    let before = i64::try_from(before?).ok()?;
    let after = i64::try_from(after?).ok()?;
    Some(after - before)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rss_delta_is_signed() {
        assert_eq!(rss_delta(Some(100), Some(250)), Some(150));
        assert_eq!(rss_delta(Some(250), Some(100)), Some(-150));
        assert_eq!(rss_delta(None, Some(100)), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rss_watch_reports_on_linux() {
        assert!(process_rss().unwrap() > 0);
        let watch = RssWatch::start("allocate");
        let buffer = vec![1u8; 8 * MIB as usize];
        assert!(watch.finish().is_some());
        drop(buffer);
    }

    #[test]
    fn test_below_hard_floor_is_fatal() {
        let guard = MemoryGuard::default();
        let err = guard.evaluate(GIB / 4).unwrap_err();
        assert!(matches!(
            err,
            IngestError::OutOfMemory {
                floor_bytes: DEFAULT_HARD_FLOOR_BYTES,
                ..
            }
        ));
    }

    #[test]
    fn test_between_floors_warns() {
        let guard = MemoryGuard::default();
        assert_eq!(
            guard.evaluate(GIB * 3 / 4).unwrap(),
            MemoryStatus::Low {
                available_bytes: GIB * 3 / 4
            }
        );
    }

    #[test]
    fn test_plenty_is_ok() {
        let guard = MemoryGuard::default();
        assert!(matches!(guard.evaluate(8 * GIB).unwrap(), MemoryStatus::Ok { .. }));
    }

    #[test]
    fn test_disabled_guard_never_reads_memory() {
        assert!(matches!(
            MemoryGuard::disabled().check().unwrap(),
            MemoryStatus::Ok { .. }
        ));
    }
}
