// Google Groups adapter
// Conversations participate in the dashboard as minimal changes

use chrono::{DateTime, Utc};

use crate::remote::groups::Conversation;

use super::change::{Account, Change, Needs, Status};

/// A mirrored Groups conversation viewed as a change. Groups pages carry
/// no machine-readable authorship or timestamps, so the adapter records
/// the observation time and leaves the author anonymous.
pub struct ConversationChange {
    group: String,
    url: String,
    conversation: Conversation,
    observed: DateTime<Utc>,
}

impl ConversationChange {
    pub fn new(
        group: impl Into<String>,
        url: impl Into<String>,
        conversation: Conversation,
        observed: DateTime<Utc>,
    ) -> Self {
        ConversationChange {
            group: group.into(),
            url: url.into(),
            conversation,
            observed,
        }
    }

    pub fn message_count(&self) -> usize {
        self.conversation.messages.len()
    }
}

impl Change for ConversationChange {
    fn id(&self) -> String {
        self.url.clone()
    }

    fn status(&self) -> Status {
        Status::Ready
    }

    fn author(&self) -> Account {
        Account {
            name: self.group.clone(),
            display_name: self.group.clone(),
            ..Account::default()
        }
    }

    fn created(&self) -> DateTime<Utc> {
        self.observed
    }

    fn updated(&self) -> DateTime<Utc> {
        self.observed
    }

    fn updated_by_author(&self) -> DateTime<Utc> {
        self.observed
    }

    fn subject(&self) -> String {
        self.conversation.title.clone()
    }

    fn description(&self) -> String {
        self.conversation.messages.first().cloned().unwrap_or_default()
    }

    fn reviewers(&self) -> Vec<Account> {
        Vec::new()
    }

    fn reviewed(&self) -> Vec<Account> {
        Vec::new()
    }

    fn needs(&self) -> Needs {
        if self.message_count() <= 1 {
            Needs::REVIEW
        } else {
            Needs::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_as_change() {
        let conv = Conversation {
            title: "proposal: generics in templates".to_string(),
            messages: vec!["first post".to_string()],
        };
        let c = ConversationChange::new(
            "golang-dev",
            "https://groups.google.com/g/golang-dev/c/abc",
            conv,
            Utc::now(),
        );
        assert_eq!(c.subject(), "proposal: generics in templates");
        assert_eq!(c.description(), "first post");
        assert_eq!(c.status(), Status::Ready);
        assert!(c.needs().contains(Needs::REVIEW));
    }
}
