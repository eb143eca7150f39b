// Account authority computation
// A work-sharded pre-pass over all mirrored changes accumulates each
// account's standing before any change is scored

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use serde::Deserialize;

use super::change::{Account, Authority};

/// Stable key for an account inside a raw Gerrit payload: email first,
/// then username, then the numeric id.
pub fn account_key(account: &serde_json::Value) -> Option<String> {
    if let Some(email) = account.get("email").and_then(|v| v.as_str()) {
        return Some(email.to_string());
    }
    if let Some(username) = account.get("username").and_then(|v| v.as_str()) {
        return Some(username.to_string());
    }
    account
        .get("_account_id")
        .and_then(|v| v.as_i64())
        .map(|id| format!("account-{id}"))
}

fn display_name(account: &serde_json::Value) -> String {
    account
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
struct Stats {
    authority: Authority,
    commits: u32,
    display_name: String,
}

impl Stats {
    fn raise(&mut self, authority: Authority) {
        if authority > self.authority {
            self.authority = authority;
        }
    }
}

/// Accumulated authorities and commit counts, one entry per account key.
#[derive(Debug, Default)]
pub struct AccountSet {
    stats: HashMap<String, Stats>,
}

impl AccountSet {
    pub fn authority(&self, key: &str) -> Authority {
        self.stats
            .get(key)
            .map(|s| s.authority)
            .unwrap_or(Authority::Unknown)
    }

    pub fn commits(&self, key: &str) -> u32 {
        self.stats.get(key).map(|s| s.commits).unwrap_or(0)
    }

    /// Materialize an [`Account`] for a raw Gerrit account payload.
    pub fn account(&self, raw: &serde_json::Value) -> Account {
        let key = account_key(raw).unwrap_or_default();
        Account {
            display_name: display_name(raw),
            authority: self.authority(&key),
            commits: self.commits(&key),
            name: key,
        }
    }

    /// Materialize an [`Account`] for a bare login (GitHub side).
    pub fn account_for_login(&self, login: &str) -> Account {
        Account {
            name: login.to_string(),
            display_name: login.to_string(),
            authority: self.authority(login),
            commits: self.commits(login),
        }
    }

    fn merge(mut self, other: AccountSet) -> AccountSet {
        for (key, theirs) in other.stats {
            let ours = self.stats.entry(key).or_default();
            ours.raise(theirs.authority);
            ours.commits += theirs.commits;
            if ours.display_name.is_empty() {
                ours.display_name = theirs.display_name;
            }
        }
        self
    }
}

/// Compute authorities from every mirrored change of a project:
/// - *Maintainer*: ever submitted a change or voted Code-Review +2;
/// - *Reviewer*: ever posted a message on a change it didn't own;
/// - *Contributor*: has at least one merged commit;
/// - else *Unknown*.
///
/// The pass shards the change list across the available parallelism; each
/// shard accumulates a local map and the locals merge at the end.
pub fn compute_authorities(changes: &[serde_json::Value]) -> AccountSet {
    changes
        .par_iter()
        .fold(AccountSet::default, |mut set, change| {
            accumulate(&mut set, change);
            set
        })
        .reduce(AccountSet::default, AccountSet::merge)
}

fn accumulate(set: &mut AccountSet, change: &serde_json::Value) {
    let owner = change.get("owner");
    let owner_key = owner.and_then(account_key);
    let status = change.get("status").and_then(|v| v.as_str()).unwrap_or("");

    // Merged changes: the owner is a contributor with one more commit
    // (GerritBot changes credit the GitHub author recorded in patch set
    // 1), and whoever submitted is a maintainer.
    if status == "MERGED" {
        let credit = gerritbot_author(change)
            .or_else(|| owner_key.clone())
            .unwrap_or_default();
        if !credit.is_empty() {
            let entry = set.stats.entry(credit).or_default();
            entry.raise(Authority::Contributor);
            entry.commits += 1;
            if entry.display_name.is_empty() {
                if let Some(owner) = owner {
                    entry.display_name = display_name(owner);
                }
            }
        }
        if let Some(submitter) = change.get("submitter").and_then(account_key) {
            set.stats.entry(submitter).or_default().raise(Authority::Maintainer);
        }
    }

    // Code-Review +2 voters are maintainers.
    if let Some(votes) = change
        .pointer("/labels/Code-Review/all")
        .and_then(|v| v.as_array())
    {
        for vote in votes {
            if vote.get("value").and_then(|v| v.as_i64()) == Some(2) {
                if let Some(key) = account_key(vote) {
                    let entry = set.stats.entry(key).or_default();
                    entry.raise(Authority::Maintainer);
                    if entry.display_name.is_empty() {
                        entry.display_name = display_name(vote);
                    }
                }
            }
        }
    }

    // Posting on someone else's change makes a reviewer.
    if let Some(messages) = change.get("messages").and_then(|v| v.as_array()) {
        for message in messages {
            let Some(author) = message.get("author") else {
                continue;
            };
            let Some(key) = account_key(author) else {
                continue;
            };
            if Some(&key) == owner_key.as_ref() {
                continue;
            }
            let entry = set.stats.entry(key).or_default();
            entry.raise(Authority::Reviewer);
            if entry.display_name.is_empty() {
                entry.display_name = display_name(author);
            }
        }
    }
}

/// GerritBot mirrors GitHub pull requests; the human author is recorded
/// as a `GitHub-Author:` trailer in patch set 1's commit message.
fn gerritbot_author(change: &serde_json::Value) -> Option<String> {
    let owner = change.get("owner")?;
    let login = owner
        .get("username")
        .or_else(|| owner.get("name"))
        .and_then(|v| v.as_str())?;
    if !login.eq_ignore_ascii_case("gerritbot") {
        return None;
    }
    let revisions = change.get("revisions")?.as_object()?;
    let first = revisions
        .values()
        .find(|rev| rev.get("_number").and_then(|v| v.as_i64()) == Some(1))?;
    let message = first.pointer("/commit/message")?.as_str()?;
    for line in message.lines() {
        if let Some(rest) = line.trim().strip_prefix("GitHub-Author:") {
            let rest = rest.trim();
            // "Name <email>" or a bare email/login.
            if let (Some(lt), Some(gt)) = (rest.find('<'), rest.rfind('>')) {
                if lt < gt {
                    return Some(rest[lt + 1..gt].trim().to_string());
                }
            }
            return Some(rest.to_string());
        }
    }
    None
}

/// Canonical decoded account record, one per numeric id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccountInfo {
    #[serde(rename = "_account_id")]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
}

/// Process-wide account cache with insert-if-absent semantics: concurrent
/// decoders of the same id converge on the first committed entry (all
/// decode identical inputs to identical values).
#[derive(Default)]
pub struct AccountCache {
    map: Mutex<HashMap<i64, Arc<AccountInfo>>>,
}

impl AccountCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `raw` into the canonical entry for its account id, reusing
    /// a cached entry when one exists.
    pub fn decode(&self, raw: &serde_json::Value) -> Option<Arc<AccountInfo>> {
        let id = raw.get("_account_id").and_then(|v| v.as_i64())?;
        if let Some(hit) = self.map.lock().unwrap().get(&id) {
            return Some(Arc::clone(hit));
        }
        // Decode outside the lock; a racing decoder's insert wins.
        let decoded = Arc::new(serde_json::from_value::<AccountInfo>(raw.clone()).ok()?);
        let mut map = self.map.lock().unwrap();
        Some(Arc::clone(map.entry(id).or_insert(decoded)))
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn merged_change(owner_email: &str) -> serde_json::Value {
        json!({
            "status": "MERGED",
            "owner": {"email": owner_email, "name": "Owner"},
            "submitter": {"email": "submitter@example.com"},
        })
    }

    #[test]
    fn merged_changes_credit_owner_and_submitter() {
        let set = compute_authorities(&[merged_change("alice@example.com")]);
        assert_eq!(set.authority("alice@example.com"), Authority::Contributor);
        assert_eq!(set.commits("alice@example.com"), 1);
        assert_eq!(
            set.authority("submitter@example.com"),
            Authority::Maintainer
        );
    }

    #[test]
    fn plus_two_vote_makes_maintainer() {
        let change = json!({
            "status": "NEW",
            "owner": {"email": "alice@example.com"},
            "labels": {"Code-Review": {"all": [
                {"email": "bob@example.com", "value": 2},
                {"email": "carol@example.com", "value": 1},
            ]}},
        });
        let set = compute_authorities(&[change]);
        assert_eq!(set.authority("bob@example.com"), Authority::Maintainer);
        assert_eq!(set.authority("carol@example.com"), Authority::Unknown);
    }

    #[test]
    fn messages_on_foreign_changes_make_reviewer() {
        let change = json!({
            "status": "NEW",
            "owner": {"email": "alice@example.com"},
            "messages": [
                {"author": {"email": "bob@example.com"}},
                {"author": {"email": "alice@example.com"}},
            ],
        });
        let set = compute_authorities(&[change]);
        assert_eq!(set.authority("bob@example.com"), Authority::Reviewer);
        // Posting on your own change earns nothing.
        assert_eq!(set.authority("alice@example.com"), Authority::Unknown);
    }

    #[test]
    fn authorities_accumulate_to_the_highest() {
        let mut changes = vec![merged_change("alice@example.com")];
        changes.push(json!({
            "status": "NEW",
            "owner": {"email": "bob@example.com"},
            "labels": {"Code-Review": {"all": [
                {"email": "alice@example.com", "value": 2},
            ]}},
        }));
        let set = compute_authorities(&changes);
        assert_eq!(set.authority("alice@example.com"), Authority::Maintainer);
        assert_eq!(set.commits("alice@example.com"), 1);
    }

    #[test]
    fn commit_counts_merge_across_shards() {
        let changes: Vec<_> = (0..64)
            .map(|_| merged_change("alice@example.com"))
            .collect();
        let set = compute_authorities(&changes);
        assert_eq!(set.commits("alice@example.com"), 64);
    }

    #[test]
    fn gerritbot_changes_credit_github_author() {
        let change = json!({
            "status": "MERGED",
            "owner": {"username": "GerritBot", "name": "Gerrit Bot"},
            "revisions": {
                "deadbeef": {
                    "_number": 1,
                    "commit": {"message": "Fix parser\n\nGitHub-Author: Dana Dev <dana@example.com>\nGitHub-PR: #12\n"}
                },
                "cafef00d": {"_number": 2, "commit": {"message": "rebase"}}
            },
        });
        let set = compute_authorities(&[change]);
        assert_eq!(set.authority("dana@example.com"), Authority::Contributor);
        assert_eq!(set.commits("dana@example.com"), 1);
        assert_eq!(set.commits("GerritBot"), 0);
    }

    #[test]
    fn account_cache_first_writer_wins() {
        let cache = AccountCache::new();
        let raw = json!({"_account_id": 7, "email": "a@example.com", "name": "A"});
        let first = cache.decode(&raw).unwrap();
        let second = cache.decode(&raw).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn account_cache_requires_id() {
        let cache = AccountCache::new();
        assert!(cache.decode(&json!({"email": "x@example.com"})).is_none());
        assert!(cache.is_empty());
    }
}
