// Gerrit adapter
// Materializes the Change interface from a mirrored Gerrit record

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::remote::gerrit::parse_timestamp;

use super::accounts::{account_key, AccountSet};
use super::change::{Account, Change, Needs, Status};

/// A mirrored Gerrit change plus the context needed to score it.
pub struct GerritChange {
    raw: serde_json::Value,
    comments: Option<serde_json::Value>,
    mergeable: Option<bool>,
    accounts: Arc<AccountSet>,
}

impl GerritChange {
    pub fn new(
        raw: serde_json::Value,
        comments: Option<serde_json::Value>,
        mergeable: Option<bool>,
        accounts: Arc<AccountSet>,
    ) -> Self {
        GerritChange {
            raw,
            comments,
            mergeable,
            accounts,
        }
    }

    pub fn number(&self) -> i64 {
        self.raw.get("_number").and_then(|v| v.as_i64()).unwrap_or(0)
    }

    fn str_field(&self, name: &str) -> &str {
        self.raw.get(name).and_then(|v| v.as_str()).unwrap_or("")
    }

    fn time_field(&self, name: &str) -> DateTime<Utc> {
        parse_timestamp(self.str_field(name)).unwrap_or_default()
    }

    fn owner_key(&self) -> Option<String> {
        self.raw.get("owner").and_then(account_key)
    }

    /// Whether the change carries a Code-Review +2 vote.
    fn has_approval(&self) -> bool {
        self.raw
            .pointer("/labels/Code-Review/all")
            .and_then(|v| v.as_array())
            .map(|votes| {
                votes
                    .iter()
                    .any(|vote| vote.get("value").and_then(|v| v.as_i64()) == Some(2))
            })
            .unwrap_or(false)
    }

    fn label_rejected(&self, label: &str) -> bool {
        self.raw
            .pointer(&format!("/labels/{label}"))
            .map(|l| {
                l.get("rejected").is_some()
                    || l.get("all")
                        .and_then(|v| v.as_array())
                        .map(|votes| {
                            votes.iter().any(|vote| {
                                vote.get("value")
                                    .and_then(|v| v.as_i64())
                                    .map(|v| v < 0)
                                    .unwrap_or(false)
                            })
                        })
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn label_approved(&self, label: &str) -> bool {
        self.raw
            .pointer(&format!("/labels/{label}/approved"))
            .is_some()
    }

    fn has_hashtag(&self, tag: &str) -> bool {
        self.raw
            .get("hashtags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .any(|t| t.as_str().map(|t| t.eq_ignore_ascii_case(tag)).unwrap_or(false))
            })
            .unwrap_or(false)
    }

    fn unresolved_comments(&self) -> i64 {
        self.raw
            .get("unresolved_comment_count")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    /// Authors of inline comments, from the mirrored comments map.
    fn comment_authors(&self) -> Vec<serde_json::Value> {
        let mut authors = Vec::new();
        let Some(map) = self.comments.as_ref().and_then(|c| c.as_object()) else {
            return authors;
        };
        for comments in map.values() {
            let Some(list) = comments.as_array() else {
                continue;
            };
            for comment in list {
                if let Some(author) = comment.get("author") {
                    authors.push(author.clone());
                }
            }
        }
        authors
    }
}

impl Change for GerritChange {
    fn id(&self) -> String {
        self.number().to_string()
    }

    fn status(&self) -> Status {
        match self.str_field("status") {
            "MERGED" => Status::Submitted,
            "ABANDONED" => Status::Closed,
            _ => {
                let wip = self
                    .raw
                    .get("work_in_progress")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if wip
                    || self.subject().to_uppercase().contains("DO NOT REVIEW")
                    || self.description().to_uppercase().contains("DO NOT REVIEW")
                {
                    Status::DoNotReview
                } else {
                    Status::Ready
                }
            }
        }
    }

    fn author(&self) -> Account {
        self.raw
            .get("owner")
            .map(|owner| self.accounts.account(owner))
            .unwrap_or_default()
    }

    fn created(&self) -> DateTime<Utc> {
        self.time_field("created")
    }

    fn updated(&self) -> DateTime<Utc> {
        self.time_field("updated")
    }

    fn updated_by_author(&self) -> DateTime<Utc> {
        // Latest revision uploaded by the owner.
        let owner = self.owner_key();
        let mut latest = self.created();
        if let Some(revisions) = self.raw.get("revisions").and_then(|v| v.as_object()) {
            for rev in revisions.values() {
                let uploader = rev.get("uploader").and_then(account_key);
                if uploader.is_some() && uploader == owner {
                    if let Some(t) = rev.get("created").and_then(|v| v.as_str()).and_then(parse_timestamp)
                    {
                        latest = latest.max(t);
                    }
                }
            }
        }
        latest
    }

    fn subject(&self) -> String {
        self.str_field("subject").to_string()
    }

    fn description(&self) -> String {
        // The current revision's commit message, when mirrored.
        if let (Some(current), Some(revisions)) = (
            self.raw.get("current_revision").and_then(|v| v.as_str()),
            self.raw.get("revisions").and_then(|v| v.as_object()),
        ) {
            if let Some(message) = revisions
                .get(current)
                .and_then(|rev| rev.pointer("/commit/message"))
                .and_then(|v| v.as_str())
            {
                return message.to_string();
            }
        }
        self.subject()
    }

    fn reviewers(&self) -> Vec<Account> {
        self.raw
            .pointer("/reviewers/REVIEWER")
            .and_then(|v| v.as_array())
            .map(|list| list.iter().map(|r| self.accounts.account(r)).collect())
            .unwrap_or_default()
    }

    fn reviewed(&self) -> Vec<Account> {
        let owner = self.owner_key();
        let mut seen: BTreeMap<String, Account> = BTreeMap::new();

        let mut consider = |raw: &serde_json::Value| {
            let Some(key) = account_key(raw) else { return };
            if Some(&key) == owner.as_ref() {
                return;
            }
            seen.entry(key).or_insert_with(|| self.accounts.account(raw));
        };

        if let Some(messages) = self.raw.get("messages").and_then(|v| v.as_array()) {
            for message in messages {
                if let Some(author) = message.get("author") {
                    consider(author);
                }
            }
        }
        for author in self.comment_authors() {
            consider(&author);
        }
        seen.into_values().collect()
    }

    fn needs(&self) -> Needs {
        let mut needs = Needs::empty();
        let reviewed = self.reviewed();

        if reviewed.is_empty() {
            needs.insert(Needs::REVIEW);
        }
        if !self.has_approval() {
            needs.insert(Needs::APPROVAL);
        }
        let maintainer_seen = reviewed
            .iter()
            .chain(self.reviewers().iter())
            .any(|a| a.authority >= super::change::Authority::Maintainer);
        if !maintainer_seen {
            needs.insert(Needs::MAINTAINER_REVIEW);
        }
        if self.unresolved_comments() > 0 {
            needs.insert(Needs::RESOLVE);
        }
        if self.mergeable == Some(false) {
            needs.insert(Needs::CONFLICT_RESOLVE);
        }
        if self.label_rejected("Verified") {
            needs.insert(Needs::CHECK);
        }
        if self.label_approved("Hold") || self.has_hashtag("hold") {
            needs.insert(Needs::HOLD);
        }
        if self.has_hashtag("wait-release") {
            needs.insert(Needs::RELEASE);
        }
        needs
    }
}
