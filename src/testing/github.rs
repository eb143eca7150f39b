// In-process GitHub double
// Serves fixture-defined issues, comments and events with the real API's
// paging quirks: ascending dated listings, a strictly descending event
// feed with an ETag and a bounded window

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::remote::github::{EventsPage, GitHubApi, Page, PAGE_SIZE};

use super::fixture;

/// Fixture-driven GitHub server double.
///
/// Fixture sections (bodies are raw JSON records):
/// - `-- issue <owner/repo> --`
/// - `-- comment <owner/repo> --`
/// - `-- event <owner/repo> --`
///
/// `window` bounds how many of the newest events the `/issues/events`
/// feed exposes, mimicking the real feed's undocumented horizon; syncs
/// that fall further behind than the window lose events.
pub struct FakeGitHub {
    issues: Mutex<Vec<(String, serde_json::Value)>>,
    comments: Mutex<Vec<(String, serde_json::Value)>>,
    events: Mutex<Vec<(String, serde_json::Value)>>,
    window: Mutex<usize>,
    page_size: usize,
}

impl Default for FakeGitHub {
    fn default() -> Self {
        FakeGitHub {
            issues: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            window: Mutex::new(usize::MAX),
            page_size: PAGE_SIZE,
        }
    }
}

impl FakeGitHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shrink pages to exercise pagination with small fixtures.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn from_fixture(text: &str) -> Self {
        let fake = Self::new();
        for section in fixture::parse(text) {
            let words = section.words();
            let Some(json) = section.json() else { continue };
            match words.as_slice() {
                ["issue", repo] => fake.add_issue(repo, json),
                ["comment", repo] => fake.add_comment(repo, json),
                ["event", repo] => fake.add_event(repo, json),
                _ => {}
            }
        }
        fake
    }

    pub fn add_issue(&self, repo: &str, issue: serde_json::Value) {
        self.issues.lock().unwrap().push((repo.to_string(), issue));
    }

    pub fn add_comment(&self, repo: &str, comment: serde_json::Value) {
        self.comments
            .lock()
            .unwrap()
            .push((repo.to_string(), comment));
    }

    pub fn add_event(&self, repo: &str, event: serde_json::Value) {
        self.events.lock().unwrap().push((repo.to_string(), event));
    }

    /// Limit the event feed to the newest `n` events.
    pub fn set_event_window(&self, n: usize) {
        *self.window.lock().unwrap() = n;
    }

    fn dated_page(
        records: &[(String, serde_json::Value)],
        repo: &str,
        since: &str,
        page: u32,
        page_size: usize,
    ) -> Page {
        let mut hits: Vec<&serde_json::Value> = records
            .iter()
            .filter(|(r, _)| r == repo)
            .map(|(_, v)| v)
            .filter(|v| {
                let updated = v.get("updated_at").and_then(|u| u.as_str()).unwrap_or("");
                since.is_empty() || updated >= since
            })
            .collect();
        hits.sort_by_key(|v| {
            (
                v.get("updated_at")
                    .and_then(|u| u.as_str())
                    .unwrap_or("")
                    .to_string(),
                v.get("id").and_then(|i| i.as_i64()).unwrap_or(0),
            )
        });
        let start = (page.saturating_sub(1) as usize) * page_size;
        let slice: Vec<serde_json::Value> = hits
            .iter()
            .skip(start)
            .take(page_size)
            .map(|v| (*v).clone())
            .collect();
        let has_next = start + slice.len() < hits.len();
        Page {
            items: slice,
            has_next,
        }
    }

    /// The visible slice of the event feed, newest first.
    fn visible_events(&self, repo: &str) -> Vec<serde_json::Value> {
        let events = self.events.lock().unwrap();
        let mut hits: Vec<&serde_json::Value> = events
            .iter()
            .filter(|(r, _)| r == repo)
            .map(|(_, v)| v)
            .collect();
        hits.sort_by_key(|v| std::cmp::Reverse(v.get("id").and_then(|i| i.as_i64()).unwrap_or(0)));
        let window = *self.window.lock().unwrap();
        hits.into_iter().take(window).cloned().collect()
    }
}

impl GitHubApi for FakeGitHub {
    async fn issues(
        &self,
        repo: &str,
        since: &str,
        page: u32,
        _cancel: &CancellationToken,
    ) -> Result<Page> {
        let issues = self.issues.lock().unwrap();
        Ok(Self::dated_page(&issues, repo, since, page, self.page_size))
    }

    async fn issue_comments(
        &self,
        repo: &str,
        since: &str,
        page: u32,
        _cancel: &CancellationToken,
    ) -> Result<Page> {
        let comments = self.comments.lock().unwrap();
        Ok(Self::dated_page(
            &comments,
            repo,
            since,
            page,
            self.page_size,
        ))
    }

    async fn events(
        &self,
        repo: &str,
        page: u32,
        etag: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<EventsPage> {
        let visible = self.visible_events(repo);
        let current_etag = visible
            .first()
            .and_then(|v| v.get("id").and_then(|i| i.as_i64()))
            .map(|id| format!("\"{id}\""))
            .unwrap_or_else(|| "\"empty\"".to_string());
        if page == 1 && etag == Some(current_etag.as_str()) {
            return Ok(EventsPage::NotModified);
        }
        let start = (page.saturating_sub(1) as usize) * self.page_size;
        let items: Vec<serde_json::Value> =
            visible.iter().skip(start).take(self.page_size).cloned().collect();
        let has_next = start + items.len() < visible.len();
        Ok(EventsPage::Page {
            etag: Some(current_etag),
            items,
            has_next,
        })
    }

    async fn issue_events(
        &self,
        repo: &str,
        issue: i64,
        page: u32,
        _cancel: &CancellationToken,
    ) -> Result<Page> {
        let events = self.events.lock().unwrap();
        let mut hits: Vec<&serde_json::Value> = events
            .iter()
            .filter(|(r, _)| r == repo)
            .map(|(_, v)| v)
            .filter(|v| {
                v.pointer("/issue/number").and_then(|n| n.as_i64()) == Some(issue)
            })
            .collect();
        hits.sort_by_key(|v| v.get("id").and_then(|i| i.as_i64()).unwrap_or(0));
        let start = (page.saturating_sub(1) as usize) * self.page_size;
        let items: Vec<serde_json::Value> = hits
            .iter()
            .skip(start)
            .take(self.page_size)
            .map(|v| (*v).clone())
            .collect();
        let has_next = start + items.len() < hits.len();
        Ok(Page { items, has_next })
    }
}
