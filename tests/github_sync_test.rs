// Integration tests for the GitHub mirror
// Bootstrap, incremental catch-up, 304 short-circuit, and the lost-sync
// recovery path, all against the in-process double

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use reviewscope::errors::Error;
use reviewscope::review::accounts::AccountSet;
use reviewscope::review::board;
use reviewscope::review::change::Change;
use reviewscope::storage::kv::MemStore;
use reviewscope::sync::github::{GitHubSync, API_ISSUES, API_ISSUE_COMMENTS, API_ISSUE_EVENTS};
use reviewscope::testing::github::FakeGitHub;

const REPO: &str = "golang/go";

fn issue(number: i64, updated: &str) -> serde_json::Value {
    serde_json::json!({
        "id": 1000 + number,
        "number": number,
        "title": format!("issue {number}"),
        "body": "details",
        "state": "open",
        "user": {"login": "alice"},
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": updated,
    })
}

fn event(id: i64, issue: i64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "event": "labeled",
        "created_at": format!("2024-01-0{}T00:00:00Z", (id % 9) + 1),
        "issue": {"number": issue},
    })
}

fn comment(id: i64, issue: i64, login: &str, at: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "user": {"login": login},
        "body": "looks good",
        "created_at": at,
        "updated_at": at,
        "issue_url": format!("https://api.github.com/repos/{REPO}/issues/{issue}"),
    })
}

fn fresh() -> (GitHubSync<FakeGitHub>, CancellationToken) {
    let fake = FakeGitHub::new();
    let db = Arc::new(MemStore::new());
    let sync = GitHubSync::new(db, fake);
    sync.add(REPO);
    (sync, CancellationToken::new())
}

#[tokio::test]
async fn bootstrap_mirrors_every_issue_and_event() {
    // A new repo with 3 issues and 5 events holds every event with
    // id <= the saved mark after the first sync.
    let (sync, cancel) = fresh();
    for n in 1..=3 {
        sync.client().add_issue(REPO, issue(n, &format!("2024-02-0{n}T00:00:00Z")));
    }
    for (id, on) in [(1, 1), (2, 1), (3, 2), (4, 3), (5, 3)] {
        sync.client().add_event(REPO, event(id, on));
    }

    sync.sync_repo(REPO, &cancel).await.unwrap();

    assert_eq!(sync.issue_numbers(REPO), vec![1, 2, 3]);
    assert_eq!(sync.event_ids(REPO, API_ISSUE_EVENTS), vec![1, 2, 3, 4, 5]);
    assert_eq!(sync.event_ids(REPO, API_ISSUES).len(), 3);
}

#[tokio::test]
async fn incremental_sync_has_no_gaps() {
    let (sync, cancel) = fresh();
    sync.client().add_issue(REPO, issue(1, "2024-02-01T00:00:00Z"));
    for id in 1..=4 {
        sync.client().add_event(REPO, event(id, 1));
    }
    sync.sync_repo(REPO, &cancel).await.unwrap();

    // New activity lands; an incremental scan must pick up every id in
    // (old mark, new mark].
    for id in 5..=9 {
        sync.client().add_event(REPO, event(id, 1));
    }
    sync.sync_repo(REPO, &cancel).await.unwrap();
    assert_eq!(
        sync.event_ids(REPO, API_ISSUE_EVENTS),
        (1..=9).collect::<Vec<i64>>()
    );

    // Quiet repo: the saved ETag short-circuits to 304 and nothing moves.
    sync.sync_repo(REPO, &cancel).await.unwrap();
    assert_eq!(
        sync.event_ids(REPO, API_ISSUE_EVENTS),
        (1..=9).collect::<Vec<i64>>()
    );
}

#[tokio::test]
async fn losing_the_event_window_errors_and_rebootstrap_recovers() {
    let (sync, cancel) = fresh();
    sync.client().add_issue(REPO, issue(1, "2024-02-01T00:00:00Z"));
    sync.client().add_event(REPO, event(1, 1));
    sync.sync_repo(REPO, &cancel).await.unwrap();

    // Far more new events than the feed window exposes: the incremental
    // scan cannot reach the old mark.
    for id in 2..=40 {
        sync.client().add_event(REPO, event(id, 1));
    }
    sync.client().set_event_window(10);
    let err = sync.sync_repo(REPO, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::LostSync { .. }), "got {err}");

    // The documented recovery: clear the cursor and re-bootstrap.
    sync.reset_events(REPO);
    sync.sync_repo(REPO, &cancel).await.unwrap();
    // The per-issue walk sees everything, window or not.
    assert_eq!(
        sync.event_ids(REPO, API_ISSUE_EVENTS),
        (1..=40).collect::<Vec<i64>>()
    );
}

#[tokio::test]
async fn comments_attach_to_their_issue() {
    let (sync, cancel) = fresh();
    sync.client().add_issue(REPO, issue(7, "2024-02-01T00:00:00Z"));
    sync.client()
        .add_comment(REPO, comment(11, 7, "bob", "2024-02-02T10:00:00Z"));
    sync.client()
        .add_comment(REPO, comment(12, 7, "alice", "2024-02-03T10:00:00Z"));
    sync.sync_repo(REPO, &cancel).await.unwrap();

    assert_eq!(sync.event_ids(REPO, API_ISSUE_COMMENTS), vec![11, 12]);
    let history = sync.events(REPO, 7);
    // Issue record plus two comments, time-sorted.
    assert_eq!(history.len(), 3);
}

#[tokio::test]
async fn mirrored_issues_adapt_to_changes() {
    let (sync, cancel) = fresh();
    sync.client().add_issue(REPO, issue(7, "2024-02-01T00:00:00Z"));
    sync.client()
        .add_comment(REPO, comment(11, 7, "bob", "2024-02-02T10:00:00Z"));
    sync.sync_repo(REPO, &cancel).await.unwrap();

    let changes = board::github_board_changes(&sync, REPO, Arc::new(AccountSet::default()));
    assert_eq!(changes.len(), 1);
    let change = &changes[0];
    assert_eq!(change.id(), format!("{REPO}#7"));
    assert_eq!(change.author().name, "alice");
    let reviewed = change.reviewed();
    assert_eq!(reviewed.len(), 1);
    assert_eq!(reviewed[0].name, "bob");
}

#[tokio::test]
async fn issue_updates_replace_the_stored_record() {
    let (sync, cancel) = fresh();
    sync.client().add_issue(REPO, issue(1, "2024-02-01T00:00:00Z"));
    sync.sync_repo(REPO, &cancel).await.unwrap();

    let mut updated = issue(1, "2024-03-01T00:00:00Z");
    updated["state"] = serde_json::json!("closed");
    sync.client().add_issue(REPO, updated);
    sync.sync_repo(REPO, &cancel).await.unwrap();

    let stored = sync.issue(REPO, 1).unwrap();
    assert_eq!(stored["state"], "closed");
}
