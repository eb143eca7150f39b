// Gerrit REST API client
// All Gerrit REST responses are prefixed with `)]}'\n` (XSSI protection);
// this module strips that prefix transparently before deserializing JSON.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::{Error, Result};

use super::http::{client, Backoff};

/// The XSSI-protection prefix prepended to every Gerrit REST response.
const XSSI_PREFIX: &str = ")]}'\n";

/// Gerrit timestamp format: `"2024-03-01 14:22:05.000000000"` (always UTC).
const GERRIT_TS_FMT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Retry budget for 429 responses.
const MAX_RETRIES: u32 = 20;
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Parse a Gerrit timestamp.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, GERRIT_TS_FMT)
        .ok()
        .map(|ndt| ndt.and_utc())
}

/// Format a timestamp the way Gerrit's `before:`/`after:` operators
/// expect it.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(GERRIT_TS_FMT).to_string()
}

/// A change search against one Gerrit instance, bracketed by update
/// timestamps. `skip` is the per-timestamp de-duplication cursor.
#[derive(Debug, Clone, Default)]
pub struct ChangeQuery {
    pub project: String,
    /// Inclusive lower bound on `updated`, Gerrit timestamp format.
    pub after: String,
    /// Inclusive upper bound on `updated`.
    pub before: String,
    pub limit: usize,
    pub skip: i64,
}

impl ChangeQuery {
    /// Encode as a Gerrit query string (space-separated predicates).
    pub fn to_query_string(&self) -> String {
        let mut parts = vec![format!("p:{}", self.project)];
        if !self.after.is_empty() {
            parts.push(format!("after:\"{}\"", self.after));
        }
        if !self.before.is_empty() {
            parts.push(format!("before:\"{}\"", self.before));
        }
        parts.push(format!("limit:{}", self.limit));
        parts.join(" ")
    }
}

/// The subset of the Gerrit REST surface the sync engine consumes.
/// Implemented by [`GerritClient`] and by the in-process double in
/// `testing::gerrit`.
pub trait GerritApi: Send + Sync {
    /// Fetch one page of changes matching `query`, newest first.
    fn query_changes(
        &self,
        query: &ChangeQuery,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>>> + Send;

    /// Fetch the file → comment-list map for a change.
    fn comments(
        &self,
        change: i64,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<serde_json::Value>> + Send;

    /// Probe whether the change's current revision is mergeable.
    fn mergeable(
        &self,
        change: i64,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<bool>> + Send;
}

/// HTTP client bound to a single Gerrit instance.
pub struct GerritClient {
    /// Base URL with no trailing slash, e.g. `https://go-review.googlesource.com`.
    base_url: String,
    http: reqwest::Client,
    /// Optional HTTP Basic Auth credentials `(username, http-password)`.
    auth: Option<(String, String)>,
}

impl GerritClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(GerritClient {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            http: client()?,
            auth: None,
        })
    }

    /// Attach HTTP Basic Auth credentials (username + Gerrit HTTP password).
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    /// GET a Gerrit endpoint, strip the XSSI guard, parse JSON.
    ///
    /// 429 responses retry with exponential back-off (1s doubling to a
    /// 60s cap, at most 20 attempts); the back-off sleep is
    /// cancellation-aware. Any other non-2xx is fatal for the request.
    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let mut backoff = Backoff::new(BACKOFF_INITIAL, BACKOFF_CAP);
        for attempt in 0..MAX_RETRIES {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut req = self.http.get(url).query(query);
            if let Some((user, pass)) = &self.auth {
                req = req.basic_auth(user, Some(pass));
            }
            let response = req.send().await?;
            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(url, attempt, "Gerrit rate limited; backing off");
                backoff.wait(cancel).await?;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::network_with_status(
                    format!("Gerrit returned HTTP {status} for {url}: {body}"),
                    status.as_u16(),
                ));
            }
            let text = response.text().await?;
            let json = strip_xssi(&text)?;
            return Ok(serde_json::from_str(json)?);
        }
        Err(Error::RetriesExhausted {
            attempts: MAX_RETRIES,
            message: format!("GET {url}"),
        })
    }
}

impl GerritApi for GerritClient {
    async fn query_changes(
        &self,
        query: &ChangeQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/changes/", self.base_url);
        let params = [
            ("q", query.to_query_string()),
            ("o", "ALL_REVISIONS".to_string()),
            ("o", "DETAILED_ACCOUNTS".to_string()),
            ("o", "LABELS".to_string()),
            ("o", "MESSAGES".to_string()),
            ("S", query.skip.to_string()),
        ];
        match self.get_json(&url, &params, cancel).await? {
            serde_json::Value::Array(items) => Ok(items),
            other => Err(Error::network(format!(
                "Gerrit /changes/ returned a non-array: {other}"
            ))),
        }
    }

    async fn comments(
        &self,
        change: i64,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/changes/{change}/comments", self.base_url);
        self.get_json(&url, &[], cancel).await
    }

    async fn mergeable(&self, change: i64, cancel: &CancellationToken) -> Result<bool> {
        let url = format!(
            "{}/changes/{change}/revisions/current/mergeable",
            self.base_url
        );
        let json = self.get_json(&url, &[], cancel).await?;
        Ok(json
            .get("mergeable")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }
}

fn strip_xssi(s: &str) -> Result<&str> {
    s.strip_prefix(XSSI_PREFIX).ok_or_else(|| {
        Error::network(format!(
            "response is missing the Gerrit XSSI prefix; got {:?}",
            s.chars().take(12).collect::<String>()
        ))
    })
}
