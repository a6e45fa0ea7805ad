//! candata Common Library
//!
//! Shared utilities and error handling for the candata pipeline crates.
//!
//! # Overview
//!
//! - **Error Handling**: workspace error type and result alias
//! - **Logging**: `tracing` subscriber bootstrap driven by `LOG_*` variables
//! - **Checksums**: SHA-256 helpers for content-addressed file names
//! - **Env**: typed environment variable lookups used by configuration loaders
//!
//! # Example
//!
//! ```no_run
//! use candata_common::checksum::sha256_file;
//!
//! fn fingerprint(path: &str) -> candata_common::Result<()> {
//!     let digest = sha256_file(path)?;
//!     tracing::info!(%digest, "file fingerprint");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod env;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CandataError, Result};
