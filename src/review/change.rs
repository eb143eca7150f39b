// The uniform Change abstraction
// Every mirrored record adapts to this interface for scoring and display

use std::fmt;

use chrono::{DateTime, Utc};

use crate::filter::value::Value;

/// Lifecycle state of a change, collapsed across sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Open and eligible for review.
    Ready,
    /// Merged/submitted.
    Submitted,
    /// Abandoned or closed without submission.
    Closed,
    /// Open but explicitly not to be reviewed (WIP, DO NOT REVIEW).
    DoNotReview,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ready => "ready",
            Status::Submitted => "submitted",
            Status::Closed => "closed",
            Status::DoNotReview => "do_not_review",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An account's standing within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Authority {
    #[default]
    Unknown,
    Contributor,
    Reviewer,
    Maintainer,
    Owner,
}

impl Authority {
    pub fn as_str(self) -> &'static str {
        match self {
            Authority::Unknown => "unknown",
            Authority::Contributor => "contributor",
            Authority::Reviewer => "reviewer",
            Authority::Maintainer => "maintainer",
            Authority::Owner => "owner",
        }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant in a change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    /// Stable identifier: email or login.
    pub name: String,
    /// Human-readable name for display.
    pub display_name: String,
    pub authority: Authority,
    /// Merged commits attributed to this account.
    pub commits: u32,
}

impl Account {
    pub fn project(&self) -> Value {
        Value::record([
            ("name", Value::str(&self.name)),
            ("display_name", Value::str(&self.display_name)),
            ("authority", Value::str(self.authority.as_str())),
            ("commits", Value::Uint(self.commits as u64)),
        ])
    }
}

/// What a change still needs before it can land, as a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Needs(u32);

impl Needs {
    pub const REVIEW: Needs = Needs(1 << 0);
    pub const APPROVAL: Needs = Needs(1 << 1);
    pub const MAINTAINER_REVIEW: Needs = Needs(1 << 2);
    pub const RESOLVE: Needs = Needs(1 << 3);
    pub const CONFLICT_RESOLVE: Needs = Needs(1 << 4);
    pub const CHECK: Needs = Needs(1 << 5);
    pub const HOLD: Needs = Needs(1 << 6);
    pub const RELEASE: Needs = Needs(1 << 7);
    pub const OTHER: Needs = Needs(1 << 8);

    pub const fn empty() -> Needs {
        Needs(0)
    }

    pub fn contains(self, other: Needs) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Needs) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The set bits as names, for projection and display.
    pub fn names(self) -> Vec<&'static str> {
        const TABLE: [(Needs, &str); 9] = [
            (Needs::REVIEW, "review"),
            (Needs::APPROVAL, "approval"),
            (Needs::MAINTAINER_REVIEW, "maintainer_review"),
            (Needs::RESOLVE, "resolve"),
            (Needs::CONFLICT_RESOLVE, "conflict"),
            (Needs::CHECK, "check"),
            (Needs::HOLD, "hold"),
            (Needs::RELEASE, "release"),
            (Needs::OTHER, "other"),
        ];
        TABLE
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for Needs {
    type Output = Needs;
    fn bitor(self, rhs: Needs) -> Needs {
        Needs(self.0 | rhs.0)
    }
}

impl fmt::Display for Needs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join("+"))
    }
}

/// A reviewable unit of work, adapted from any mirrored source.
pub trait Change: Send + Sync {
    fn id(&self) -> String;
    fn status(&self) -> Status;
    fn author(&self) -> Account;
    fn created(&self) -> DateTime<Utc>;
    fn updated(&self) -> DateTime<Utc>;
    /// The last time the author uploaded a revision (or otherwise acted).
    fn updated_by_author(&self) -> DateTime<Utc>;
    fn subject(&self) -> String;
    fn description(&self) -> String;
    /// Requested reviewers.
    fn reviewers(&self) -> Vec<Account>;
    /// Distinct message/comment posters other than the author.
    fn reviewed(&self) -> Vec<Account>;
    fn needs(&self) -> Needs;
}

/// Project a change into the filter value model.
pub fn project_change(change: &dyn Change) -> Value {
    Value::record([
        ("id", Value::str(change.id())),
        ("status", Value::str(change.status().as_str())),
        ("author", change.author().project()),
        ("created", Value::Time(change.created())),
        ("updated", Value::Time(change.updated())),
        ("updated_by_author", Value::Time(change.updated_by_author())),
        ("subject", Value::str(change.subject())),
        ("description", Value::str(change.description())),
        (
            "reviewers",
            Value::list(change.reviewers().iter().map(Account::project)),
        ),
        (
            "reviewed",
            Value::list(change.reviewed().iter().map(Account::project)),
        ),
        (
            "needs",
            Value::list(change.needs().names().into_iter().map(Value::str)),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_is_ordered() {
        assert!(Authority::Unknown < Authority::Contributor);
        assert!(Authority::Contributor < Authority::Reviewer);
        assert!(Authority::Reviewer < Authority::Maintainer);
        assert!(Authority::Maintainer < Authority::Owner);
    }

    #[test]
    fn needs_bit_operations() {
        let mut n = Needs::empty();
        assert!(n.is_empty());
        n.insert(Needs::REVIEW);
        n.insert(Needs::CONFLICT_RESOLVE);
        assert!(n.contains(Needs::REVIEW));
        assert!(n.contains(Needs::CONFLICT_RESOLVE));
        assert!(!n.contains(Needs::HOLD));
        assert_eq!(n.names(), vec!["review", "conflict"]);
        assert_eq!(n.to_string(), "review+conflict");
    }

    #[test]
    fn needs_bitor() {
        let n = Needs::REVIEW | Needs::APPROVAL;
        assert!(n.contains(Needs::REVIEW) && n.contains(Needs::APPROVAL));
    }
}
