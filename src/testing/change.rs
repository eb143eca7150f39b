// Scripted change
// A fully in-memory Change implementation for pipeline and dashboard tests

use chrono::{DateTime, TimeZone, Utc};

use crate::review::change::{Account, Authority, Change, Needs, Status};

/// A change whose every accessor is a plain field. Tests construct the
/// exact shape they need instead of mirroring a source.
#[derive(Debug, Clone)]
pub struct TestChange {
    pub id: String,
    pub status: Status,
    pub authority: Authority,
    pub commits: u32,
    pub subject: String,
    pub description: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub reviewers: Vec<Account>,
    pub reviewed: Vec<Account>,
    pub needs: Needs,
}

impl Default for TestChange {
    fn default() -> Self {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TestChange {
            id: "1".to_string(),
            status: Status::Ready,
            authority: Authority::Unknown,
            commits: 0,
            subject: String::new(),
            description: String::new(),
            created: t,
            updated: t,
            reviewers: Vec::new(),
            reviewed: Vec::new(),
            needs: Needs::empty(),
        }
    }
}

impl Change for TestChange {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn status(&self) -> Status {
        self.status
    }

    fn author(&self) -> Account {
        Account {
            name: "author".to_string(),
            display_name: "Author".to_string(),
            authority: self.authority,
            commits: self.commits,
        }
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    fn updated_by_author(&self) -> DateTime<Utc> {
        self.updated
    }

    fn subject(&self) -> String {
        if self.subject.is_empty() {
            format!("change {}", self.id)
        } else {
            self.subject.clone()
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn reviewers(&self) -> Vec<Account> {
        self.reviewers.clone()
    }

    fn reviewed(&self) -> Vec<Account> {
        self.reviewed.clone()
    }

    fn needs(&self) -> Needs {
        self.needs
    }
}
