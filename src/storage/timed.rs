// Timed secondary index overlay
// Pairs every primary write with a DBTime-ordered index entry

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::keys::{Key, KeyReader};
use super::kv::{Batch, Db};

/// Suffix appended to a kind to name its by-time index.
const BY_TIME: &str = "ByTime";

/// Kind under which watcher checkpoints are stored.
const WATCHER_KIND: &str = "watcher";

// Process-wide monotonic write clock, microseconds since the epoch with a
// strictly-increasing guarantee under concurrent callers.
static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Allocate the next database write time.
pub fn next_dbtime() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    CLOCK
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
            Some(prev.max(now).saturating_add(1))
        })
        .unwrap_or(now)
        .max(now)
}

/// Encoded primary key for `kind` + `suffix`.
pub fn primary_key(kind: &str, suffix: &[u8]) -> Vec<u8> {
    let mut k = Key::kind(kind).build();
    k.extend_from_slice(suffix);
    k
}

fn by_time_key(kind: &str, dbtime: u64, suffix: &[u8]) -> Vec<u8> {
    let mut k = Key::kind(&format!("{kind}{BY_TIME}"));
    k.push_u64(dbtime);
    let mut k = k.build();
    k.extend_from_slice(suffix);
    k
}

/// Write `value` at `(kind, suffix)` and a parallel `{kind}ByTime` index
/// entry, both in the same batch. Both writes become visible in the same
/// apply step, so a time scan never observes an index entry whose primary
/// record is missing.
///
/// Returns the allocated DBTime.
pub fn set(batch: &mut Batch<'_>, kind: &str, suffix: &[u8], value: &[u8]) -> u64 {
    let t = next_dbtime();
    batch.set(&primary_key(kind, suffix), value);
    batch.set(&by_time_key(kind, t, suffix), &[]);
    t
}

/// One entry from a time-ordered scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEntry {
    pub dbtime: u64,
    /// Encoded key parts after the kind; append to the kind to rebuild the
    /// primary key.
    pub suffix: Vec<u8>,
}

impl TimedEntry {
    pub fn primary_key(&self, kind: &str) -> Vec<u8> {
        primary_key(kind, &self.suffix)
    }
}

/// Named cursor over a kind's by-time index.
///
/// `recent` returns entries written after the last `mark_old` checkpoint,
/// oldest first. Checkpoints are persisted, so a watcher resumes where it
/// left off across restarts.
pub struct Watcher<'a> {
    db: &'a dyn Db,
    name: String,
    kind: String,
}

impl<'a> Watcher<'a> {
    pub fn new(db: &'a dyn Db, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Watcher {
            db,
            name: name.into(),
            kind: kind.into(),
        }
    }

    fn checkpoint_key(&self) -> Vec<u8> {
        let mut k = Key::kind(WATCHER_KIND);
        k.push_str(&self.kind).push_str(&self.name);
        k.build()
    }

    fn checkpoint(&self) -> u64 {
        self.db
            .get(&self.checkpoint_key())
            .and_then(|v| v.try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0)
    }

    /// Entries with `dbtime` after the checkpoint, in DBTime order.
    pub fn recent(&self) -> Vec<TimedEntry> {
        let after = self.checkpoint();
        let index_kind = format!("{}{BY_TIME}", self.kind);
        let mut start = Key::kind(&index_kind);
        start.push_u64(after.saturating_add(1));
        let (_, end) = Key::kind(&index_kind).prefix_range();

        self.db
            .scan(start.bytes(), &end)
            .into_iter()
            .filter_map(|entry| {
                let mut r = KeyReader::new(entry.key());
                r.read_str()?; // index kind
                let dbtime = r.read_u64()?;
                Some(TimedEntry {
                    dbtime,
                    suffix: r.remainder().to_vec(),
                })
            })
            .collect()
    }

    /// Commit the checkpoint: subsequent `recent` calls skip entries at or
    /// before `dbtime`. Checkpoints only move forward.
    pub fn mark_old(&self, dbtime: u64) {
        if dbtime <= self.checkpoint() {
            return;
        }
        self.db.set(&self.checkpoint_key(), &dbtime.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemStore;

    fn suffix(parts: &[&str]) -> Vec<u8> {
        let mut k = Key::default();
        for p in parts {
            k.push_str(p);
        }
        k.build()
    }

    #[test]
    fn dbtime_is_strictly_increasing() {
        let a = next_dbtime();
        let b = next_dbtime();
        let c = next_dbtime();
        assert!(a < b && b < c);
    }

    #[test]
    fn set_writes_primary_and_index_atomically() {
        let db = MemStore::new();
        let s = suffix(&["proj", "42"]);

        let mut batch = Batch::new(&db);
        set(&mut batch, "github.Event", &s, b"{}");
        // Neither entry is visible before apply.
        assert!(db.get(&primary_key("github.Event", &s)).is_none());
        let w = Watcher::new(&db, "t", "github.Event");
        assert!(w.recent().is_empty());

        batch.apply();
        assert!(db.get(&primary_key("github.Event", &s)).is_some());
        let entries = w.recent();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].primary_key("github.Event"), primary_key("github.Event", &s));
    }

    #[test]
    fn watcher_resumes_after_mark_old() {
        let db = MemStore::new();
        let w = Watcher::new(&db, "worker", "k");

        let mut batch = Batch::new(&db);
        set(&mut batch, "k", &suffix(&["a"]), b"1");
        let t2 = set(&mut batch, "k", &suffix(&["b"]), b"2");
        batch.apply();

        let entries = w.recent();
        assert_eq!(entries.len(), 2);
        w.mark_old(t2);
        assert!(w.recent().is_empty());

        let mut batch = Batch::new(&db);
        set(&mut batch, "k", &suffix(&["c"]), b"3");
        batch.apply();
        assert_eq!(w.recent().len(), 1);
    }

    #[test]
    fn watcher_checkpoint_never_regresses() {
        let db = MemStore::new();
        let w = Watcher::new(&db, "worker", "k");
        let mut batch = Batch::new(&db);
        let t1 = set(&mut batch, "k", &suffix(&["a"]), b"1");
        let t2 = set(&mut batch, "k", &suffix(&["b"]), b"2");
        batch.apply();

        w.mark_old(t2);
        w.mark_old(t1); // older mark must be ignored
        assert!(w.recent().is_empty());
    }

    #[test]
    fn entries_are_time_ordered() {
        let db = MemStore::new();
        let mut batch = Batch::new(&db);
        // Interleave suffixes so key order differs from time order.
        set(&mut batch, "k", &suffix(&["z"]), b"1");
        set(&mut batch, "k", &suffix(&["a"]), b"2");
        batch.apply();

        let w = Watcher::new(&db, "w", "k");
        let entries = w.recent();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].dbtime < entries[1].dbtime);
        assert_eq!(entries[0].suffix, suffix(&["z"]));
    }
}
