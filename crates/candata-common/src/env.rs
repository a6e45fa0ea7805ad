//! Typed environment variable lookups
//!
//! Configuration loaders read plain values from the process environment
//! (after `dotenvy` has populated it). A variable that is unset falls back to
//! the supplied default; a variable that is set but unparsable is an error
//! rather than a silent fallback.

use crate::error::{CandataError, Result};
use std::str::FromStr;

/// Read `key` and parse it, or return `default` when unset
pub fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| CandataError::InvalidEnv {
            key: key.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

/// Read `key` as a string, or return `default` when unset
pub fn string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read `key` as an optional non-empty string
pub fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
