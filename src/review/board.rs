// Board assembly
// Materializes scored-change inputs from the mirrored stores

use std::sync::Arc;

use chrono::Utc;

use crate::preds::BoardChange;
use crate::remote::gerrit::GerritApi;
use crate::remote::github::GitHubApi;
use crate::remote::groups::GroupsApi;
use crate::sync::gerrit::GerritSync;
use crate::sync::github::GitHubSync;
use crate::sync::groups::GroupSync;

use super::accounts::{compute_authorities, AccountSet};
use super::gerrit::GerritChange;
use super::github::IssueChange;
use super::groups::ConversationChange;

/// Materialize every mirrored Gerrit change of one project, with the
/// authority pre-pass applied.
pub fn gerrit_board_changes<C: GerritApi>(
    sync: &GerritSync<C>,
    project: &str,
) -> (Arc<AccountSet>, Vec<BoardChange>) {
    let raws: Vec<serde_json::Value> = sync
        .change_numbers(project)
        .into_iter()
        .filter_map(|num| sync.change(project, num))
        .collect();
    let accounts = Arc::new(compute_authorities(&raws));

    let changes = raws
        .into_iter()
        .map(|raw| {
            let num = raw.get("_number").and_then(|v| v.as_i64()).unwrap_or(0);
            let change = GerritChange::new(
                raw,
                sync.comments(project, num),
                sync.mergeable(project, num),
                Arc::clone(&accounts),
            );
            Arc::new(change) as BoardChange
        })
        .collect();
    (accounts, changes)
}

/// Materialize every mirrored issue of one repo. `accounts` carries
/// authorities when the project links its Gerrit and GitHub identities;
/// pass an empty set otherwise.
pub fn github_board_changes<C: GitHubApi>(
    sync: &GitHubSync<C>,
    repo: &str,
    accounts: Arc<AccountSet>,
) -> Vec<BoardChange> {
    sync.issue_numbers(repo)
        .into_iter()
        .filter_map(|number| {
            let issue = sync.issue(repo, number)?;
            let comments: Vec<serde_json::Value> = sync
                .events(repo, number)
                .into_iter()
                .filter(|e| e.get("issue_url").is_some())
                .collect();
            Some(Arc::new(IssueChange::new(repo, issue, comments, Arc::clone(&accounts)))
                as BoardChange)
        })
        .collect()
}

/// Materialize every mirrored conversation of one group.
pub fn groups_board_changes<C: GroupsApi>(sync: &GroupSync<C>, group: &str) -> Vec<BoardChange> {
    let observed = Utc::now();
    sync.conversations(group)
        .into_iter()
        .map(|(url, conversation)| {
            Arc::new(ConversationChange::new(group, url, conversation, observed)) as BoardChange
        })
        .collect()
}
