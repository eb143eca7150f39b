// Gerrit change mirror
// Interval-bounded incremental sync with a resumable watermark cursor

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::remote::gerrit::{format_timestamp, ChangeQuery, GerritApi};
use crate::storage::keys::Key;
use crate::storage::kv::{Batch, Db, LockGuard};
use crate::storage::timed;

/// Record kinds owned by this sync.
pub const KIND_SYNC_PROJECT: &str = "gerrit.SyncProject";
pub const KIND_CHANGE: &str = "gerrit.Change";
pub const KIND_COMMENT: &str = "gerrit.Comment";
pub const KIND_CHANGE_UPDATE: &str = "gerrit.ChangeUpdate";
pub const KIND_CHANGE_MERGEABLE: &str = "gerrit.ChangeMergeable";

/// Changes per request; Gerrit's hard cap.
const PAGE_LIMIT: usize = 500;

/// Writes between forced apply+flush, bounding loss on interruption.
const FLUSH_EVERY: usize = 100;

/// Age at which the mergeable cache is swept again.
const MERGEABLE_REFRESH: Duration = Duration::from_secs(72 * 60 * 60);

/// Per-project sync cursor.
///
/// The invariant between iterations: the database reflects every change
/// update with `updated <= low_mark`. `[low_mark, high_mark]` is the open
/// work item; `current_mark <= high_mark` is how far back this iteration
/// has scanned, and `skip` de-duplicates records sharing the boundary
/// timestamp (Gerrit's `before:` is inclusive).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectSync {
    pub low_mark: String,
    pub high_mark: String,
    pub current_mark: String,
    pub skip: i64,
}

/// Mirrors changes and comments for one Gerrit instance.
pub struct GerritSync<C> {
    db: Arc<dyn Db>,
    client: C,
    instance: String,
    /// Last mergeable sweep, held in memory on the instance; newer wins.
    mergeable_refreshed: Mutex<Option<Instant>>,
}

impl<C: GerritApi> GerritSync<C> {
    pub fn new(db: Arc<dyn Db>, client: C, instance: impl Into<String>) -> Self {
        GerritSync {
            db,
            client,
            instance: instance.into(),
            mergeable_refreshed: Mutex::new(None),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The underlying API client (the double, in tests).
    pub fn client(&self) -> &C {
        &self.client
    }

    fn cursor_key(&self, project: &str) -> Vec<u8> {
        let mut k = Key::kind(KIND_SYNC_PROJECT);
        k.push_str(&self.instance).push_str(project);
        k.build()
    }

    fn change_key(&self, project: &str, num: i64) -> Vec<u8> {
        let mut k = Key::kind(KIND_CHANGE);
        k.push_str(&self.instance).push_str(project).push_i64(num);
        k.build()
    }

    fn comment_key(&self, project: &str, num: i64) -> Vec<u8> {
        let mut k = Key::kind(KIND_COMMENT);
        k.push_str(&self.instance).push_str(project).push_i64(num);
        k.build()
    }

    fn mergeable_key(&self, project: &str, num: i64) -> Vec<u8> {
        let mut k = Key::kind(KIND_CHANGE_MERGEABLE);
        k.push_str(&self.instance).push_str(project).push_i64(num);
        k.build()
    }

    fn lock_name(&self, project: &str) -> String {
        format!("gerritsync-{}-{project}", self.instance)
    }

    /// Register a project for syncing. Idempotent; registration never
    /// deletes.
    pub fn add(&self, project: &str) {
        let key = self.cursor_key(project);
        if self.db.get(&key).is_none() {
            let cur = ProjectSync::default();
            self.db
                .set(&key, &serde_json::to_vec(&cur).expect("cursor serializes"));
        }
    }

    /// All registered projects of this instance.
    pub fn projects(&self) -> Vec<String> {
        let mut prefix = Key::kind(KIND_SYNC_PROJECT);
        prefix.push_str(&self.instance);
        let (start, end) = prefix.prefix_range();
        self.db
            .scan(&start, &end)
            .into_iter()
            .filter_map(|e| {
                let mut r = crate::storage::keys::KeyReader::new(e.key());
                r.read_str()?; // kind
                r.read_str()?; // instance
                r.read_str()
            })
            .collect()
    }

    fn load_cursor(&self, project: &str) -> ProjectSync {
        match self.db.get(&self.cursor_key(project)) {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                self.db
                    .panic_corrupt(&format!("gerrit.SyncProject for {project}: {err}"))
            }),
            None => ProjectSync::default(),
        }
    }

    fn save_cursor(&self, batch: &mut Batch<'_>, project: &str, cur: &ProjectSync) {
        batch.set(
            &self.cursor_key(project),
            &serde_json::to_vec(cur).expect("cursor serializes"),
        );
    }

    /// Sync every registered project, one at a time.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<()> {
        for project in self.projects() {
            self.sync_project(&project, cancel).await?;
        }
        Ok(())
    }

    /// Mirror all change updates for one project.
    ///
    /// Serialized per project by a named lock held for the entire sync.
    /// Safe to interrupt at any point: the persisted cursor tracks
    /// committed progress only, and a restart re-reads at most the last
    /// page.
    pub async fn sync_project(&self, project: &str, cancel: &CancellationToken) -> Result<()> {
        let _guard = LockGuard::acquire(self.db.as_ref(), self.lock_name(project));
        info!(instance = %self.instance, project, "gerrit sync starting");

        let mut cur = self.load_cursor(project);
        if cur.high_mark.is_empty() {
            cur.high_mark = format_timestamp(Utc::now());
            cur.current_mark = cur.high_mark.clone();
            cur.skip = 0;
            let mut batch = Batch::new(self.db.as_ref());
            self.save_cursor(&mut batch, project, &cur);
            batch.apply();
        }

        loop {
            let any = self.sync_interval_changes(project, &mut cur, cancel).await?;
            if !any {
                break;
            }
            // New updates landed while we scanned; open a fresh interval
            // above the one just finished.
            cur.low_mark = cur.high_mark.clone();
            cur.high_mark = format_timestamp(Utc::now());
            cur.current_mark = cur.high_mark.clone();
            cur.skip = 0;
            let mut batch = Batch::new(self.db.as_ref());
            self.save_cursor(&mut batch, project, &cur);
            batch.apply();
        }

        cur.low_mark = cur.high_mark.clone();
        cur.high_mark.clear();
        cur.current_mark.clear();
        cur.skip = 0;
        let mut batch = Batch::new(self.db.as_ref());
        self.save_cursor(&mut batch, project, &cur);
        batch.apply();
        self.db.flush();
        info!(instance = %self.instance, project, "gerrit sync complete");
        Ok(())
    }

    /// Walk the open interval `[low_mark, current_mark]` newest-first,
    /// writing every change whose meta id is new. Returns whether any
    /// record was written.
    async fn sync_interval_changes(
        &self,
        project: &str,
        cur: &mut ProjectSync,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut wrote_any = false;
        // Meta ids written during this interval, to skip re-writes when a
        // page boundary re-serves a record.
        let mut in_batch: HashSet<(i64, String)> = HashSet::new();

        loop {
            let query = ChangeQuery {
                project: project.to_string(),
                after: cur.low_mark.clone(),
                before: cur.current_mark.clone(),
                limit: PAGE_LIMIT,
                skip: cur.skip,
            };
            let changes = self.client.query_changes(&query, cancel).await?;
            let page_len = changes.len();
            debug!(project, page_len, skip = cur.skip, "gerrit page");

            let mut batch = Batch::new(self.db.as_ref());
            let mut writes = 0usize;
            for change in changes {
                let num = match change.get("_number").and_then(|v| v.as_i64()) {
                    Some(n) => n,
                    None => self
                        .db
                        .panic_corrupt(&format!("gerrit change without _number in {project}")),
                };
                let meta = match change.get("meta_rev_id").and_then(|v| v.as_str()) {
                    Some(m) => m.to_string(),
                    None => self.db.panic_corrupt(&format!(
                        "gerrit change {num} in {project} without meta_rev_id"
                    )),
                };
                let updated = match change.get("updated").and_then(|v| v.as_str()) {
                    Some(u) => u.to_string(),
                    None => self.db.panic_corrupt(&format!(
                        "gerrit change {num} in {project} without updated"
                    )),
                };

                let cached = in_batch.contains(&(num, meta.clone()))
                    || self.stored_meta(project, num).as_deref() == Some(meta.as_str());
                if !cached {
                    let raw = serde_json::to_vec(&change)?;
                    batch.set(&self.change_key(project, num), &raw);

                    let comments = self.client.comments(num, cancel).await?;
                    batch.set(&self.comment_key(project, num), &serde_json::to_vec(&comments)?);

                    let mut suffix = Key::default();
                    suffix.push_str(&self.instance).push_i64(num).push_str(&meta);
                    timed::set(&mut batch, KIND_CHANGE_UPDATE, suffix.bytes(), &[]);

                    in_batch.insert((num, meta));
                    wrote_any = true;
                    writes += 1;
                }

                // Advance the scan cursor past this record. Skip counts
                // records sharing the boundary timestamp, so an inclusive
                // `before:` never re-emits them after a restart.
                if updated == cur.current_mark {
                    cur.skip += 1;
                } else {
                    cur.current_mark = updated;
                    cur.skip = 1;
                }

                if writes > 0 && writes % FLUSH_EVERY == 0 {
                    self.save_cursor(&mut batch, project, cur);
                    batch.apply();
                    self.db.flush();
                }
            }

            self.save_cursor(&mut batch, project, cur);
            batch.apply();
            self.db.flush();

            if page_len < PAGE_LIMIT {
                return Ok(wrote_any);
            }
        }
    }

    /// The stored meta id of a mirrored change, if present.
    fn stored_meta(&self, project: &str, num: i64) -> Option<String> {
        let raw = self.db.get(&self.change_key(project, num))?;
        let json: serde_json::Value = serde_json::from_slice(&raw).ok()?;
        json.get("meta_rev_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    // --- accessors ---

    /// The raw mirrored change record.
    pub fn change(&self, project: &str, num: i64) -> Option<serde_json::Value> {
        let raw = self.db.get(&self.change_key(project, num))?;
        serde_json::from_slice(&raw).ok()
    }

    /// The mirrored file → comments map of a change.
    pub fn comments(&self, project: &str, num: i64) -> Option<serde_json::Value> {
        let raw = self.db.get(&self.comment_key(project, num))?;
        serde_json::from_slice(&raw).ok()
    }

    /// All mirrored change numbers of a project, ascending.
    pub fn change_numbers(&self, project: &str) -> Vec<i64> {
        let mut prefix = Key::kind(KIND_CHANGE);
        prefix.push_str(&self.instance).push_str(project);
        let (start, end) = prefix.prefix_range();
        self.db
            .scan(&start, &end)
            .into_iter()
            .filter_map(|e| {
                let mut r = crate::storage::keys::KeyReader::new(e.key());
                r.read_str()?;
                r.read_str()?;
                r.read_str()?;
                r.read_i64()
            })
            .collect()
    }

    // --- mergeable cache ---

    /// The cached mergeable bit of a change.
    pub fn mergeable(&self, project: &str, num: i64) -> Option<bool> {
        let raw = self.db.get(&self.mergeable_key(project, num))?;
        serde_json::from_slice(&raw).ok()
    }

    /// Sweep the mergeable endpoint for every open change if the last
    /// sweep is older than 72 hours. Returns whether a sweep ran.
    ///
    /// Mergeability depends on repository state, not only on change
    /// updates, so it is refreshed on a clock rather than on events. The
    /// sweep takes the same per-project lock as the sync, so concurrent
    /// invocations serialize.
    pub async fn refresh_mergeable_if_stale(&self, cancel: &CancellationToken) -> Result<bool> {
        {
            let mut last = self.mergeable_refreshed.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < MERGEABLE_REFRESH {
                    return Ok(false);
                }
            }
            *last = Some(Instant::now());
        }
        for project in self.projects() {
            let _guard = LockGuard::acquire(self.db.as_ref(), self.lock_name(&project));
            let mut batch = Batch::new(self.db.as_ref());
            for num in self.change_numbers(&project) {
                let open = self
                    .change(&project, num)
                    .and_then(|c| c.get("status").and_then(|s| s.as_str()).map(|s| s == "NEW"))
                    .unwrap_or(false);
                if !open {
                    continue;
                }
                match self.client.mergeable(num, cancel).await {
                    Ok(m) => {
                        batch.set(&self.mergeable_key(&project, num), &serde_json::to_vec(&m)?);
                        batch.maybe_apply();
                    }
                    Err(err) => {
                        warn!(project, num, %err, "mergeable probe failed");
                    }
                }
            }
            batch.apply();
            self.db.flush();
        }
        Ok(true)
    }

    /// Kick a background mergeable sweep when the cache is stale.
    pub fn queue_mergeable_refresh(self: &Arc<Self>, cancel: CancellationToken)
    where
        C: 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.refresh_mergeable_if_stale(&cancel).await {
                warn!(%err, "mergeable refresh failed");
            }
        });
    }
}
