// GitHub issue mirror
// Date-ordered issue/comment sync plus the two-phase event sync: a full
// bootstrap walk, then incremental catch-up against a bounded feed

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::remote::github::{EventsPage, GitHubApi};
use crate::storage::keys::{Key, KeyReader};
use crate::storage::kv::{Batch, Db, LockGuard};
use crate::storage::timed;

/// Record kinds owned by this sync.
pub const KIND_SYNC_PROJECT: &str = "github.SyncProject";
pub const KIND_EVENT: &str = "github.Event";

/// API names stored in event keys.
pub const API_ISSUES: &str = "/issues";
pub const API_ISSUE_COMMENTS: &str = "/issues/comments";
pub const API_ISSUE_EVENTS: &str = "/issues/events";

/// Pages fetched before restarting a dated listing with a fresh `since`
/// (GitHub stops serving results past page 1000).
const RESTART_EVERY_PAGES: u32 = 500;

/// Per-repo sync cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoSync {
    pub event_etag: String,
    pub event_id: i64,
    pub issue_date: String,
    pub comment_date: String,
    pub full_sync_active: bool,
    pub full_sync_issue: i64,
}

/// Mirrors issues, issue comments and issue events for GitHub repos.
pub struct GitHubSync<C> {
    db: Arc<dyn Db>,
    client: C,
}

impl<C: GitHubApi> GitHubSync<C> {
    pub fn new(db: Arc<dyn Db>, client: C) -> Self {
        GitHubSync { db, client }
    }

    /// The underlying API client (the double, in tests).
    pub fn client(&self) -> &C {
        &self.client
    }

    fn cursor_key(&self, repo: &str) -> Vec<u8> {
        let mut k = Key::kind(KIND_SYNC_PROJECT);
        k.push_str(repo);
        k.build()
    }

    fn event_suffix(repo: &str, issue: i64, api: &str, id: i64) -> Vec<u8> {
        let mut k = Key::default();
        k.push_str(repo).push_i64(issue).push_str(api).push_i64(id);
        k.build()
    }

    fn lock_name(repo: &str) -> String {
        format!("githubsync-{repo}")
    }

    /// Register an `owner/repo` for syncing. Idempotent.
    pub fn add(&self, repo: &str) {
        let key = self.cursor_key(repo);
        if self.db.get(&key).is_none() {
            let cur = RepoSync::default();
            self.db
                .set(&key, &serde_json::to_vec(&cur).expect("cursor serializes"));
        }
    }

    /// All registered repos.
    pub fn repos(&self) -> Vec<String> {
        let (start, end) = Key::kind(KIND_SYNC_PROJECT).prefix_range();
        self.db
            .scan(&start, &end)
            .into_iter()
            .filter_map(|e| {
                let mut r = KeyReader::new(e.key());
                r.read_str()?;
                r.read_str()
            })
            .collect()
    }

    fn load_cursor(&self, repo: &str) -> RepoSync {
        match self.db.get(&self.cursor_key(repo)) {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                self.db
                    .panic_corrupt(&format!("github.SyncProject for {repo}: {err}"))
            }),
            None => RepoSync::default(),
        }
    }

    fn save_cursor(&self, batch: &mut Batch<'_>, repo: &str, cur: &RepoSync) {
        batch.set(
            &self.cursor_key(repo),
            &serde_json::to_vec(cur).expect("cursor serializes"),
        );
    }

    /// Sync every registered repo, one at a time.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<()> {
        for repo in self.repos() {
            self.sync_repo(&repo, cancel).await?;
        }
        Ok(())
    }

    /// Mirror one repo: issues, then comments, then the event feed.
    pub async fn sync_repo(&self, repo: &str, cancel: &CancellationToken) -> Result<()> {
        let _guard = LockGuard::acquire(self.db.as_ref(), Self::lock_name(repo));
        info!(repo, "github sync starting");
        let mut cur = self.load_cursor(repo);

        self.sync_issues(repo, &mut cur, cancel).await?;
        self.sync_comments(repo, &mut cur, cancel).await?;
        self.sync_events(repo, &mut cur, cancel).await?;

        let mut batch = Batch::new(self.db.as_ref());
        self.save_cursor(&mut batch, repo, &cur);
        batch.apply();
        self.db.flush();
        info!(repo, "github sync complete");
        Ok(())
    }

    /// Write one event record if its bytes changed, via the timed index.
    fn write_event(
        &self,
        batch: &mut Batch<'_>,
        repo: &str,
        issue: i64,
        api: &str,
        id: i64,
        item: &serde_json::Value,
    ) -> Result<bool> {
        let suffix = Self::event_suffix(repo, issue, api, id);
        let raw = serde_json::to_vec(item)?;
        if self.db.get(&timed::primary_key(KIND_EVENT, &suffix)).as_deref() == Some(raw.as_slice())
        {
            return Ok(false);
        }
        timed::set(batch, KIND_EVENT, &suffix, &raw);
        Ok(true)
    }

    fn item_id(&self, repo: &str, item: &serde_json::Value) -> i64 {
        match item.get("id").and_then(|v| v.as_i64()) {
            Some(id) => id,
            None => self
                .db
                .panic_corrupt(&format!("github record without id in {repo}")),
        }
    }

    // --- date-ordered listings ---

    async fn sync_issues(
        &self,
        repo: &str,
        cur: &mut RepoSync,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut page = 1u32;
        let mut since = cur.issue_date.clone();
        loop {
            let p = self.client.issues(repo, &since, page, cancel).await?;
            debug!(repo, page, items = p.items.len(), "github issues page");
            let mut batch = Batch::new(self.db.as_ref());
            for item in &p.items {
                let id = self.item_id(repo, item);
                let number = match item.get("number").and_then(|v| v.as_i64()) {
                    Some(n) => n,
                    None => self
                        .db
                        .panic_corrupt(&format!("github issue {id} in {repo} without number")),
                };
                self.write_event(&mut batch, repo, number, API_ISSUES, id, item)?;
                if let Some(updated) = item.get("updated_at").and_then(|v| v.as_str()) {
                    cur.issue_date = updated.to_string();
                }
            }
            self.save_cursor(&mut batch, repo, cur);
            batch.apply();
            self.db.flush();

            if !p.has_next {
                return Ok(());
            }
            page += 1;
            if page > RESTART_EVERY_PAGES {
                page = 1;
                since = cur.issue_date.clone();
            }
        }
    }

    async fn sync_comments(
        &self,
        repo: &str,
        cur: &mut RepoSync,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut page = 1u32;
        let mut since = cur.comment_date.clone();
        loop {
            let p = self
                .client
                .issue_comments(repo, &since, page, cancel)
                .await?;
            debug!(repo, page, items = p.items.len(), "github comments page");
            let mut batch = Batch::new(self.db.as_ref());
            for item in &p.items {
                let id = self.item_id(repo, item);
                let issue = match issue_of_comment(item) {
                    Some(n) => n,
                    None => self
                        .db
                        .panic_corrupt(&format!("github comment {id} in {repo} without issue_url")),
                };
                self.write_event(&mut batch, repo, issue, API_ISSUE_COMMENTS, id, item)?;
                if let Some(updated) = item.get("updated_at").and_then(|v| v.as_str()) {
                    cur.comment_date = updated.to_string();
                }
            }
            self.save_cursor(&mut batch, repo, cur);
            batch.apply();
            self.db.flush();

            if !p.has_next {
                return Ok(());
            }
            page += 1;
            if page > RESTART_EVERY_PAGES {
                page = 1;
                since = cur.comment_date.clone();
            }
        }
    }

    // --- event feed ---

    /// The `/issues/events` feed is strictly descending with no `since=`,
    /// so a new repo bootstraps: record the newest event id as a marker,
    /// mirror every issue's own event list, then switch to incremental
    /// catch-up scans bounded by the marker.
    async fn sync_events(
        &self,
        repo: &str,
        cur: &mut RepoSync,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cur.event_id == 0 || cur.full_sync_active {
            return self.bootstrap_events(repo, cur, cancel).await;
        }
        self.incremental_events(repo, cur, cancel).await
    }

    async fn bootstrap_events(
        &self,
        repo: &str,
        cur: &mut RepoSync,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !cur.full_sync_active {
            // Marker page: capture the newest event id and its ETag
            // without storing any events.
            match self.client.events(repo, 1, None, cancel).await? {
                EventsPage::Page { etag, items, .. } => {
                    cur.event_id = items
                        .first()
                        .map(|item| self.item_id(repo, item))
                        .unwrap_or(0);
                    cur.event_etag = etag.unwrap_or_default();
                }
                EventsPage::NotModified => {
                    // No ETag was sent; treat as an empty feed.
                    cur.event_id = 0;
                    cur.event_etag.clear();
                }
            }
            cur.full_sync_active = true;
            cur.full_sync_issue = 0;
            let mut batch = Batch::new(self.db.as_ref());
            self.save_cursor(&mut batch, repo, cur);
            batch.apply();
            self.db.flush();
            info!(repo, marker = cur.event_id, "github event bootstrap starting");
        }

        // The issue sync has already mirrored every issue; walk them in
        // key order, resuming past the last fully-stored issue.
        for issue in self.issue_numbers(repo) {
            if issue <= cur.full_sync_issue {
                continue;
            }
            let mut page = 1u32;
            loop {
                let p = self.client.issue_events(repo, issue, page, cancel).await?;
                let mut batch = Batch::new(self.db.as_ref());
                for item in &p.items {
                    let id = self.item_id(repo, item);
                    self.write_event(&mut batch, repo, issue, API_ISSUE_EVENTS, id, item)?;
                }
                batch.apply();
                if !p.has_next {
                    break;
                }
                page += 1;
            }
            cur.full_sync_issue = issue;
            let mut batch = Batch::new(self.db.as_ref());
            self.save_cursor(&mut batch, repo, cur);
            batch.apply();
            self.db.flush();
        }

        cur.full_sync_active = false;
        cur.full_sync_issue = 0;
        let mut batch = Batch::new(self.db.as_ref());
        self.save_cursor(&mut batch, repo, cur);
        batch.apply();
        self.db.flush();
        info!(repo, "github event bootstrap complete");
        Ok(())
    }

    async fn incremental_events(
        &self,
        repo: &str,
        cur: &mut RepoSync,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut page = 1u32;
        let mut newest: Option<(i64, String)> = None;
        loop {
            let etag = if cur.event_etag.is_empty() {
                None
            } else {
                Some(cur.event_etag.as_str())
            };
            match self.client.events(repo, page, etag, cancel).await? {
                EventsPage::NotModified => {
                    debug!(repo, "github events unchanged");
                    return Ok(());
                }
                EventsPage::Page {
                    etag,
                    items,
                    has_next,
                } => {
                    if page == 1 {
                        newest = items
                            .first()
                            .map(|item| (self.item_id(repo, item), etag.unwrap_or_default()));
                    }
                    let mut batch = Batch::new(self.db.as_ref());
                    for item in &items {
                        let id = self.item_id(repo, item);
                        if id <= cur.event_id {
                            // Caught up with the previous scan; commit the
                            // new high-water mark.
                            if let Some((newest_id, newest_etag)) = newest.clone() {
                                cur.event_id = newest_id;
                                cur.event_etag = newest_etag;
                            }
                            self.save_cursor(&mut batch, repo, cur);
                            batch.apply();
                            self.db.flush();
                            return Ok(());
                        }
                        let issue = issue_of_event(item).unwrap_or(0);
                        self.write_event(&mut batch, repo, issue, API_ISSUE_EVENTS, id, item)?;
                    }
                    batch.apply();
                    if !has_next {
                        if cur.event_id == 0 && newest.is_some() {
                            // Empty marker: the whole feed fits in the
                            // window, so the scan is complete.
                            let (newest_id, newest_etag) = newest.clone().unwrap();
                            cur.event_id = newest_id;
                            cur.event_etag = newest_etag;
                            let mut batch = Batch::new(self.db.as_ref());
                            self.save_cursor(&mut batch, repo, cur);
                            batch.apply();
                            self.db.flush();
                            return Ok(());
                        }
                        // The feed's window ended before we reached the
                        // previous mark: events were lost.
                        warn!(repo, "github event window exhausted before catch-up");
                        return Err(Error::LostSync {
                            project: repo.to_string(),
                        });
                    }
                    page += 1;
                }
            }
        }
    }

    /// Clear the event cursor so the next sync re-runs the bootstrap.
    /// The recovery path for [`Error::LostSync`].
    pub fn reset_events(&self, repo: &str) {
        let mut cur = self.load_cursor(repo);
        cur.event_id = 0;
        cur.event_etag.clear();
        cur.full_sync_active = false;
        cur.full_sync_issue = 0;
        let mut batch = Batch::new(self.db.as_ref());
        self.save_cursor(&mut batch, repo, &cur);
        batch.apply();
        self.db.flush();
    }

    // --- accessors ---

    /// Distinct issue numbers mirrored for a repo, ascending.
    pub fn issue_numbers(&self, repo: &str) -> Vec<i64> {
        let mut prefix = Key::kind(KIND_EVENT);
        prefix.push_str(repo);
        let (start, end) = prefix.prefix_range();
        let mut out: Vec<i64> = Vec::new();
        for e in self.db.scan(&start, &end) {
            let mut r = KeyReader::new(e.key());
            let parsed = (|| {
                r.read_str()?;
                r.read_str()?;
                r.read_i64()
            })();
            if let Some(n) = parsed {
                if out.last() != Some(&n) {
                    out.push(n);
                }
            }
        }
        out
    }

    /// Every stored record for one issue — issues, comments and events
    /// mixed — sorted by creation order.
    pub fn events(&self, repo: &str, issue: i64) -> Vec<serde_json::Value> {
        let mut prefix = Key::kind(KIND_EVENT);
        prefix.push_str(repo).push_i64(issue);
        let (start, end) = prefix.prefix_range();
        let mut records: Vec<serde_json::Value> = self
            .db
            .scan(&start, &end)
            .into_iter()
            .filter_map(|e| serde_json::from_slice(&e.value()).ok())
            .collect();
        records.sort_by_key(|r| {
            let when = r
                .get("created_at")
                .or_else(|| r.get("updated_at"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let id = r.get("id").and_then(|v| v.as_i64()).unwrap_or(0);
            (when, id)
        });
        records
    }

    /// The newest stored issue record, reconstructed from the mirror.
    pub fn issue(&self, repo: &str, issue: i64) -> Option<serde_json::Value> {
        let mut prefix = Key::kind(KIND_EVENT);
        prefix.push_str(repo).push_i64(issue).push_str(API_ISSUES);
        let (start, end) = prefix.prefix_range();
        self.db
            .scan(&start, &end)
            .into_iter()
            .last()
            .and_then(|e| serde_json::from_slice(&e.value()).ok())
    }

    /// All stored event ids for a repo (any api), ascending.
    pub fn event_ids(&self, repo: &str, api: &str) -> Vec<i64> {
        let mut prefix = Key::kind(KIND_EVENT);
        prefix.push_str(repo);
        let (start, end) = prefix.prefix_range();
        let mut ids: Vec<i64> = self
            .db
            .scan(&start, &end)
            .into_iter()
            .filter_map(|e| {
                let mut r = KeyReader::new(e.key());
                r.read_str()?;
                r.read_str()?;
                r.read_i64()?;
                let this_api = r.read_str()?;
                if this_api != api {
                    return None;
                }
                r.read_i64()
            })
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Issue number of a comment record, from its `issue_url`.
fn issue_of_comment(item: &serde_json::Value) -> Option<i64> {
    let url = item.get("issue_url")?.as_str()?;
    url.rsplit('/').next()?.parse().ok()
}

/// Issue number of an event record, from its embedded issue.
fn issue_of_event(item: &serde_json::Value) -> Option<i64> {
    item.get("issue")?.get("number")?.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_issue_number_from_url() {
        let item = serde_json::json!({
            "id": 9,
            "issue_url": "https://api.github.com/repos/o/r/issues/42"
        });
        assert_eq!(issue_of_comment(&item), Some(42));
        assert_eq!(issue_of_comment(&serde_json::json!({"id": 9})), None);
    }

    #[test]
    fn event_issue_number_from_payload() {
        let item = serde_json::json!({
            "id": 9,
            "issue": {"number": 7}
        });
        assert_eq!(issue_of_event(&item), Some(7));
        assert_eq!(issue_of_event(&serde_json::json!({"id": 9})), None);
    }
}
