// In-process Gerrit double
// Serves fixture-defined changes with the real API's paging semantics:
// reverse chronological order, inclusive bounds, limit and skip

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::remote::gerrit::{ChangeQuery, GerritApi};

use super::fixture;

/// Fixture-driven Gerrit server double.
///
/// Fixture sections:
/// - `-- change <num> --` with a raw change JSON body (must carry
///   `_number`, `meta_rev_id`, `updated`, `project`);
/// - `-- comments <num> --` with a file → comments JSON body;
/// - `-- mergeable <num> --` with `true` or `false`.
#[derive(Default)]
pub struct FakeGerrit {
    changes: Mutex<Vec<serde_json::Value>>,
    comments: Mutex<HashMap<i64, serde_json::Value>>,
    mergeable: Mutex<HashMap<i64, bool>>,
    queries: AtomicUsize,
    comment_fetches: AtomicUsize,
}

impl FakeGerrit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(text: &str) -> Self {
        let fake = Self::new();
        for section in fixture::parse(text) {
            let words = section.words();
            match words.as_slice() {
                ["change", _num] => {
                    if let Some(json) = section.json() {
                        fake.put_change(json);
                    }
                }
                ["comments", num] => {
                    if let (Ok(num), Some(json)) = (num.parse(), section.json()) {
                        fake.put_comments(num, json);
                    }
                }
                ["mergeable", num] => {
                    if let (Ok(num), Some(json)) = (num.parse(), section.json()) {
                        if let Some(m) = json.as_bool() {
                            fake.put_mergeable(num, m);
                        }
                    }
                }
                _ => {}
            }
        }
        fake
    }

    /// Add or replace a change record (matched by `_number`).
    pub fn put_change(&self, change: serde_json::Value) {
        let num = change.get("_number").and_then(|v| v.as_i64());
        let mut changes = self.changes.lock().unwrap();
        if let Some(at) = changes
            .iter()
            .position(|c| c.get("_number").and_then(|v| v.as_i64()) == num)
        {
            changes[at] = change;
        } else {
            changes.push(change);
        }
    }

    pub fn put_comments(&self, num: i64, comments: serde_json::Value) {
        self.comments.lock().unwrap().insert(num, comments);
    }

    pub fn put_mergeable(&self, num: i64, mergeable: bool) {
        self.mergeable.lock().unwrap().insert(num, mergeable);
    }

    /// Pages served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Comment fetches so far; the sync only fetches comments when it
    /// writes a change, so this counts writes.
    pub fn comment_fetch_count(&self) -> usize {
        self.comment_fetches.load(Ordering::SeqCst)
    }
}

impl GerritApi for FakeGerrit {
    async fn query_changes(
        &self,
        query: &ChangeQuery,
        _cancel: &CancellationToken,
    ) -> Result<Vec<serde_json::Value>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let changes = self.changes.lock().unwrap();
        let mut hits: Vec<&serde_json::Value> = changes
            .iter()
            .filter(|c| {
                c.get("project").and_then(|v| v.as_str()) == Some(query.project.as_str())
            })
            .filter(|c| {
                let updated = c.get("updated").and_then(|v| v.as_str()).unwrap_or("");
                // Timestamps compare lexicographically; both bounds are
                // inclusive, like the real server.
                (query.after.is_empty() || updated >= query.after.as_str())
                    && (query.before.is_empty() || updated <= query.before.as_str())
            })
            .collect();
        // Reverse chronological, ties broken by descending number so the
        // order is stable across pages.
        hits.sort_by(|a, b| {
            let ua = a.get("updated").and_then(|v| v.as_str()).unwrap_or("");
            let ub = b.get("updated").and_then(|v| v.as_str()).unwrap_or("");
            ub.cmp(ua).then_with(|| {
                let na = a.get("_number").and_then(|v| v.as_i64()).unwrap_or(0);
                let nb = b.get("_number").and_then(|v| v.as_i64()).unwrap_or(0);
                nb.cmp(&na)
            })
        });
        Ok(hits
            .into_iter()
            .skip(query.skip.max(0) as usize)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn comments(
        &self,
        change: i64,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        self.comment_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(&change)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({})))
    }

    async fn mergeable(&self, change: i64, _cancel: &CancellationToken) -> Result<bool> {
        Ok(self
            .mergeable
            .lock()
            .unwrap()
            .get(&change)
            .copied()
            .unwrap_or(true))
    }
}
