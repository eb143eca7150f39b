// GitHub adapter
// Materializes the Change interface from mirrored issue records

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::accounts::AccountSet;
use super::change::{Account, Change, Needs, Status};

/// A mirrored GitHub issue plus its comment history.
pub struct IssueChange {
    repo: String,
    issue: serde_json::Value,
    comments: Vec<serde_json::Value>,
    accounts: Arc<AccountSet>,
}

impl IssueChange {
    pub fn new(
        repo: impl Into<String>,
        issue: serde_json::Value,
        comments: Vec<serde_json::Value>,
        accounts: Arc<AccountSet>,
    ) -> Self {
        IssueChange {
            repo: repo.into(),
            issue,
            comments,
            accounts,
        }
    }

    pub fn number(&self) -> i64 {
        self.issue.get("number").and_then(|v| v.as_i64()).unwrap_or(0)
    }

    fn str_field(&self, name: &str) -> &str {
        self.issue.get(name).and_then(|v| v.as_str()).unwrap_or("")
    }

    fn time_field(&self, name: &str) -> DateTime<Utc> {
        parse_rfc3339(self.str_field(name))
    }

    fn author_login(&self) -> String {
        self.issue
            .pointer("/user/login")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

impl Change for IssueChange {
    fn id(&self) -> String {
        format!("{}#{}", self.repo, self.number())
    }

    fn status(&self) -> Status {
        match self.str_field("state") {
            "closed" => Status::Closed,
            _ => {
                let text = format!("{} {}", self.subject(), self.description()).to_uppercase();
                if text.contains("DO NOT REVIEW") {
                    Status::DoNotReview
                } else {
                    Status::Ready
                }
            }
        }
    }

    fn author(&self) -> Account {
        self.accounts.account_for_login(&self.author_login())
    }

    fn created(&self) -> DateTime<Utc> {
        self.time_field("created_at")
    }

    fn updated(&self) -> DateTime<Utc> {
        self.time_field("updated_at")
    }

    fn updated_by_author(&self) -> DateTime<Utc> {
        let author = self.author_login();
        let mut latest = self.created();
        for comment in &self.comments {
            if comment.pointer("/user/login").and_then(|v| v.as_str()) == Some(author.as_str()) {
                if let Some(t) = comment.get("created_at").and_then(|v| v.as_str()) {
                    latest = latest.max(parse_rfc3339(t));
                }
            }
        }
        latest
    }

    fn subject(&self) -> String {
        self.str_field("title").to_string()
    }

    fn description(&self) -> String {
        self.str_field("body").to_string()
    }

    fn reviewers(&self) -> Vec<Account> {
        self.issue
            .get("assignees")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|a| a.get("login").and_then(|v| v.as_str()))
                    .map(|login| self.accounts.account_for_login(login))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn reviewed(&self) -> Vec<Account> {
        let author = self.author_login();
        let mut seen: BTreeMap<String, Account> = BTreeMap::new();
        for comment in &self.comments {
            let Some(login) = comment.pointer("/user/login").and_then(|v| v.as_str()) else {
                continue;
            };
            if login == author {
                continue;
            }
            seen.entry(login.to_string())
                .or_insert_with(|| self.accounts.account_for_login(login));
        }
        seen.into_values().collect()
    }

    fn needs(&self) -> Needs {
        let mut needs = Needs::empty();
        let reviewed = self.reviewed();
        if reviewed.is_empty() {
            needs.insert(Needs::REVIEW);
        }
        let maintainer_seen = reviewed
            .iter()
            .chain(self.reviewers().iter())
            .any(|a| a.authority >= super::change::Authority::Maintainer);
        if !maintainer_seen {
            needs.insert(Needs::MAINTAINER_REVIEW);
        }
        let labels = self
            .issue
            .get("labels")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|l| l.get("name").and_then(|v| v.as_str()))
                    .map(str::to_lowercase)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if labels.iter().any(|l| l == "hold") {
            needs.insert(Needs::HOLD);
        }
        if labels.iter().any(|l| l.contains("wait-release")) {
            needs.insert(Needs::RELEASE);
        }
        needs
    }
}
