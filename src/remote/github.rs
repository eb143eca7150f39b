// GitHub REST API client
// Issue, comment and event pagination with rate-limit handling

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ETAG, IF_NONE_MATCH, LINK};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{Error, Result};

use super::http::{client, sleep};

const API_BASE: &str = "https://api.github.com";

/// Items per page; the GitHub maximum.
pub const PAGE_SIZE: usize = 100;

/// Retry budget for 500/502 responses.
const MAX_SERVER_RETRIES: u32 = 3;

/// Extra margin slept past the advertised rate-limit reset.
const RESET_MARGIN: Duration = Duration::from_secs(60);

/// One page of a paginated listing.
#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<serde_json::Value>,
    /// A `Link: <...>; rel="next"` header was present.
    pub has_next: bool,
}

/// Result of fetching the repo-wide events feed with an ETag.
#[derive(Debug)]
pub enum EventsPage {
    /// 304: nothing changed since the saved ETag.
    NotModified,
    Page {
        etag: Option<String>,
        items: Vec<serde_json::Value>,
        has_next: bool,
    },
}

/// The subset of the GitHub REST surface the sync engine consumes.
/// Implemented by [`GitHubClient`] and by the in-process double in
/// `testing::github`.
pub trait GitHubApi: Send + Sync {
    /// Issues updated at or after `since`, ascending by `updated_at`.
    fn issues(
        &self,
        repo: &str,
        since: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Page>> + Send;

    /// Issue comments updated at or after `since`, ascending.
    fn issue_comments(
        &self,
        repo: &str,
        since: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Page>> + Send;

    /// The repo-wide issue event feed, strictly descending by id.
    fn events(
        &self,
        repo: &str,
        page: u32,
        etag: Option<&str>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<EventsPage>> + Send;

    /// Events of a single issue, used by the bootstrap walk.
    fn issue_events(
        &self,
        repo: &str,
        issue: i64,
        page: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Page>> + Send;
}

/// HTTP client for the GitHub REST API v3.
pub struct GitHubClient {
    base_url: String,
    http: reqwest::Client,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        Ok(GitHubClient {
            base_url: API_BASE.to_string(),
            http: client()?,
            token,
        })
    }

    /// Point the client at a different API root (test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    /// Send a GET with rate-limit and transient-failure handling:
    /// 403 with `X-RateLimit-Remaining: 0` sleeps until the advertised
    /// reset plus one minute (skipped entirely when the reset is already
    /// more than a minute in the past — a stale replay); 500/502 retry up
    /// to three times with linear back-off.
    async fn send(
        &self,
        url: &str,
        query: &[(&str, String)],
        etag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let mut server_errors = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut req = self
                .http
                .get(url)
                .query(query)
                .header("Accept", "application/vnd.github+json");
            if let Some(token) = &self.token {
                req = req.header("Authorization", format!("Bearer {token}"));
            }
            if let Some(etag) = etag {
                req = req.header(IF_NONE_MATCH, etag);
            }
            let response = req.send().await?;
            let status = response.status();

            if status == StatusCode::FORBIDDEN && rate_limited(response.headers()) {
                if let Some(dur) = rate_limit_sleep(response.headers(), Utc::now()) {
                    warn!(url, secs = dur.as_secs(), "GitHub rate limited; sleeping");
                    sleep(cancel, dur).await?;
                } else {
                    debug!(url, "stale rate-limit reset; retrying immediately");
                }
                continue;
            }
            if matches!(
                status,
                StatusCode::INTERNAL_SERVER_ERROR | StatusCode::BAD_GATEWAY
            ) {
                server_errors += 1;
                if server_errors > MAX_SERVER_RETRIES {
                    return Err(Error::RetriesExhausted {
                        attempts: server_errors,
                        message: format!("GET {url}: HTTP {status}"),
                    });
                }
                sleep(cancel, Duration::from_secs(server_errors as u64)).await?;
                continue;
            }
            if status == StatusCode::NOT_MODIFIED || status.is_success() {
                return Ok(response);
            }
            let body = response.text().await.unwrap_or_default();
            return Err(Error::network_with_status(
                format!("GitHub returned HTTP {status} for {url}: {body}"),
                status.as_u16(),
            ));
        }
    }

    async fn get_page(
        &self,
        url: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<Page> {
        let response = self.send(url, query, None, cancel).await?;
        let has_next = has_next_link(response.headers());
        let items: Vec<serde_json::Value> = response.json().await?;
        Ok(Page { items, has_next })
    }
}

impl GitHubApi for GitHubClient {
    async fn issues(
        &self,
        repo: &str,
        since: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page> {
        let url = format!("{}/repos/{repo}/issues", self.base_url);
        let mut query = vec![
            ("state", "all".to_string()),
            ("sort", "updated".to_string()),
            ("direction", "asc".to_string()),
            ("per_page", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        if !since.is_empty() {
            query.push(("since", since.to_string()));
        }
        self.get_page(&url, &query, cancel).await
    }

    async fn issue_comments(
        &self,
        repo: &str,
        since: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page> {
        let url = format!("{}/repos/{repo}/issues/comments", self.base_url);
        let mut query = vec![
            ("sort", "updated".to_string()),
            ("direction", "asc".to_string()),
            ("per_page", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        if !since.is_empty() {
            query.push(("since", since.to_string()));
        }
        self.get_page(&url, &query, cancel).await
    }

    async fn events(
        &self,
        repo: &str,
        page: u32,
        etag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<EventsPage> {
        let url = format!("{}/repos/{repo}/issues/events", self.base_url);
        let query = [
            ("per_page", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        let response = self.send(&url, &query, etag, cancel).await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(EventsPage::NotModified);
        }
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let has_next = has_next_link(response.headers());
        let items: Vec<serde_json::Value> = response.json().await?;
        Ok(EventsPage::Page {
            etag,
            items,
            has_next,
        })
    }

    async fn issue_events(
        &self,
        repo: &str,
        issue: i64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page> {
        let url = format!("{}/repos/{repo}/issues/{issue}/events", self.base_url);
        let query = [
            ("per_page", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        self.get_page(&url, &query, cancel).await
    }
}

fn rate_limited(headers: &HeaderMap) -> bool {
    headers
        .get("X-RateLimit-Remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false)
}

/// How long to sleep for a rate-limited response: until the advertised
/// reset plus a one-minute margin. `None` means the reset is stale (more
/// than a minute in the past) and the request should simply be retried.
fn rate_limit_sleep(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let reset = headers
        .get("X-RateLimit-Reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    let reset = DateTime::<Utc>::from_timestamp(reset, 0)?;
    let wake = reset + chrono::Duration::from_std(RESET_MARGIN).ok()?;
    let delta = wake - now;
    if delta <= chrono::Duration::zero() {
        return None;
    }
    delta.to_std().ok()
}

fn has_next_link(headers: &HeaderMap) -> bool {
    headers
        .get(LINK)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("rel=\"next\""))
        .unwrap_or(false)
}
