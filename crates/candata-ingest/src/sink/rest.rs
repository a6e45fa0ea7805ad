//! PostgREST-style HTTP upserts
//!
//! `POST {base}/rest/v1/{table}?on_conflict=a,b` with
//! `Prefer: resolution=merge-duplicates` turns an insert into an upsert on
//! the named unique constraint; `missing=default` fills keys a row leaves out
//! with the column default instead of null. Every request passes the shared rate
//! limiter, and transient failures are retried under the configured policy.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::UpsertTarget;
use crate::config::RestConfig;
use crate::error::{parse_retry_after, IngestError, Result};
use crate::rate_limit::RateLimiter;
use crate::retry::{with_retry, RetryPolicy};
use crate::stream::Record;

const PREFER_UPSERT: &str = "resolution=merge-duplicates,missing=default,return=minimal";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RestUpsertTarget {
    client: Client,
    base_url: String,
    limiter: Option<Arc<RateLimiter>>,
    policy: RetryPolicy,
}

impl RestUpsertTarget {
    /// Build a client that sends `api_key` as both `apikey` and bearer token
    pub fn new(base_url: impl Into<String>, api_key: &str, policy: RetryPolicy) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let invalid = |_| IngestError::config("REST API key is not a valid header value");
        let key = HeaderValue::from_str(api_key).map_err(invalid)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(invalid)?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("candata-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limiter: None,
            policy,
        })
    }

    pub fn from_config(config: &RestConfig, policy: RetryPolicy) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| IngestError::config("CANDATA_REST_URL not set"))?;
        let key = config
            .api_key
            .as_deref()
            .ok_or_else(|| IngestError::config("CANDATA_REST_KEY not set"))?;
        Self::new(url, key, policy)
    }

    /// Gate every request through a limiter shared with other callers
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn send_once(&self, url: &str, rows: &[Record], on_conflict: &str) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let response = self
            .client
            .post(url)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", PREFER_UPSERT)
            .json(rows)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %truncate(&body, 500), "upsert rejected");
        Err(IngestError::from_status(status, url, retry_after))
    }
}

#[async_trait]
impl UpsertTarget for RestUpsertTarget {
    fn name(&self) -> &str {
        "rest"
    }

    async fn upsert_batch(&self, table: &str, rows: &[Record], conflict_columns: &[String]) -> Result<()> {
        let url = self.table_url(table);
        let on_conflict = conflict_columns.join(",");

        with_retry(&self.policy, table, || self.send_once(&url, rows, &on_conflict)).await
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_table_url_strips_trailing_slash() {
        let target = RestUpsertTarget::new("http://db.local/", "k", RetryPolicy::default()).unwrap();
        assert_eq!(target.table_url("cpi"), "http://db.local/rest/v1/cpi");
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[test]
    fn test_invalid_key_is_config_error() {
        let err = RestUpsertTarget::new("http://db.local", "bad\nkey", RetryPolicy::default());
        assert!(matches!(err, Err(IngestError::Config(_))));
    }
}
