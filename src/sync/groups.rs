// Google Groups conversation mirror
// Day-stepped crawl over the search page, because the page only shows the
// ~30 most recently updated conversations per day-level window

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::remote::groups::{extract_conversation, Conversation, GroupsApi};
use crate::storage::keys::{Key, KeyReader};
use crate::storage::kv::{Batch, Db, LockGuard};
use crate::storage::timed;

/// Record kinds owned by this sync.
pub const KIND_SYNC_GROUP: &str = "google.SyncGroup";
pub const KIND_CONVERSATION: &str = "google.GroupConversation";
pub const KIND_CONVERSATION_UPDATE: &str = "google.GroupConversationUpdate";

/// Store value size limit; trailing messages are dropped to fit.
const MAX_CONVERSATION_BYTES: usize = 1 << 20;

const DATE_FMT: &str = "%Y-%m-%d";

/// Per-group sync cursor; marks are `YYYY-MM-DD` dates because the search
/// page only filters at day granularity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupCursor {
    pub low_mark: String,
    pub high_mark: String,
    pub current_mark: String,
}

/// Mirrors Google Groups conversations.
pub struct GroupSync<C> {
    db: Arc<dyn Db>,
    client: C,
}

impl<C: GroupsApi> GroupSync<C> {
    pub fn new(db: Arc<dyn Db>, client: C) -> Self {
        GroupSync { db, client }
    }

    /// The underlying API client (the double, in tests).
    pub fn client(&self) -> &C {
        &self.client
    }

    fn cursor_key(&self, group: &str) -> Vec<u8> {
        let mut k = Key::kind(KIND_SYNC_GROUP);
        k.push_str(group);
        k.build()
    }

    fn conversation_suffix(group: &str, url: &str) -> Vec<u8> {
        let mut k = Key::default();
        k.push_str(group).push_str(url);
        k.build()
    }

    /// Register a group for syncing. Idempotent.
    pub fn add(&self, group: &str) {
        let key = self.cursor_key(group);
        if self.db.get(&key).is_none() {
            let cur = GroupCursor::default();
            self.db
                .set(&key, &serde_json::to_vec(&cur).expect("cursor serializes"));
        }
    }

    /// All registered groups.
    pub fn groups(&self) -> Vec<String> {
        let (start, end) = Key::kind(KIND_SYNC_GROUP).prefix_range();
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

    fn load_cursor(&self, group: &str) -> GroupCursor {
        match self.db.get(&self.cursor_key(group)) {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                self.db
                    .panic_corrupt(&format!("google.SyncGroup for {group}: {err}"))
            }),
            None => GroupCursor::default(),
        }
    }

    fn save_cursor(&self, batch: &mut Batch<'_>, group: &str, cur: &GroupCursor) {
        batch.set(
            &self.cursor_key(group),
            &serde_json::to_vec(cur).expect("cursor serializes"),
        );
    }

    /// Sync every registered group.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<()> {
        for group in self.groups() {
            self.sync_group(&group, cancel).await?;
        }
        Ok(())
    }

    /// Crawl one group: step the search window back one day at a time
    /// until a query comes back empty, then commit the watermark.
    pub async fn sync_group(&self, group: &str, cancel: &CancellationToken) -> Result<()> {
        let _guard = LockGuard::acquire(self.db.as_ref(), format!("googlesync-{group}"));
        info!(group, "groups sync starting");

        let mut cur = self.load_cursor(group);
        if cur.high_mark.is_empty() {
            cur.high_mark = Utc::now().date_naive().format(DATE_FMT).to_string();
            cur.current_mark = cur.high_mark.clone();
            let mut batch = Batch::new(self.db.as_ref());
            self.save_cursor(&mut batch, group, &cur);
            batch.apply();
        }

        let low = parse_date(&cur.low_mark);
        loop {
            let Some(before) = parse_date(&cur.current_mark) else {
                break;
            };
            if let Some(low) = low {
                if before < low {
                    break;
                }
            }
            let links = self.client.search(group, before, low, cancel).await?;
            debug!(group, day = %before, links = links.len(), "groups search window");
            if links.is_empty() {
                break;
            }
            for url in links {
                self.store_conversation(group, &url, cancel).await?;
            }
            cur.current_mark = (before - Duration::days(1)).format(DATE_FMT).to_string();
            let mut batch = Batch::new(self.db.as_ref());
            self.save_cursor(&mut batch, group, &cur);
            batch.apply();
            self.db.flush();
        }

        // The finished interval covers everything updated up to the
        // initial high mark; back the low mark off by a day because the
        // search filter is inclusive at day granularity.
        if let Some(high) = parse_date(&cur.high_mark) {
            cur.low_mark = (high - Duration::days(1)).format(DATE_FMT).to_string();
        }
        cur.high_mark.clear();
        cur.current_mark.clear();
        let mut batch = Batch::new(self.db.as_ref());
        self.save_cursor(&mut batch, group, &cur);
        batch.apply();
        self.db.flush();
        info!(group, "groups sync complete");
        Ok(())
    }

    /// Fetch, extract and store one conversation. Conversations with no
    /// extractable messages are logged and skipped; oversized ones drop
    /// trailing messages until they fit the store's value limit.
    async fn store_conversation(
        &self,
        group: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let html = self.client.conversation(url, cancel).await?;
        let mut conv = extract_conversation(&html);
        if conv.messages.is_empty() {
            warn!(group, url, "conversation with no extractable messages; skipping");
            return Ok(false);
        }
        let mut raw = serde_json::to_vec(&conv)?;
        while raw.len() > MAX_CONVERSATION_BYTES && !conv.messages.is_empty() {
            conv.messages.pop();
            raw = serde_json::to_vec(&conv)?;
        }

        let suffix = Self::conversation_suffix(group, url);
        if self
            .db
            .get(&timed::primary_key(KIND_CONVERSATION, &suffix))
            .as_deref()
            == Some(raw.as_slice())
        {
            return Ok(false);
        }
        let mut batch = Batch::new(self.db.as_ref());
        batch.set(&timed::primary_key(KIND_CONVERSATION, &suffix), &raw);
        timed::set(&mut batch, KIND_CONVERSATION_UPDATE, &suffix, &[]);
        batch.apply();
        Ok(true)
    }

    // --- accessors ---

    /// One mirrored conversation.
    pub fn conversation(&self, group: &str, url: &str) -> Option<Conversation> {
        let suffix = Self::conversation_suffix(group, url);
        let raw = self.db.get(&timed::primary_key(KIND_CONVERSATION, &suffix))?;
        serde_json::from_slice(&raw).ok()
    }

    /// All mirrored conversations of a group, with their URLs.
    pub fn conversations(&self, group: &str) -> Vec<(String, Conversation)> {
        let mut prefix = Key::kind(KIND_CONVERSATION);
        prefix.push_str(group);
        let (start, end) = prefix.prefix_range();
        self.db
            .scan(&start, &end)
            .into_iter()
            .filter_map(|e| {
                let mut r = KeyReader::new(e.key());
                r.read_str()?;
                r.read_str()?;
                let url = r.read_str()?;
                let conv = serde_json::from_slice(&e.value()).ok()?;
                Some((url, conv))
            })
            .collect()
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FMT).ok()
}
