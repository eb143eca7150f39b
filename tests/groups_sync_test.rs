// Integration tests for the Google Groups mirror
// Day-stepped crawl, extraction failures, and the size clamp

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use reviewscope::storage::kv::MemStore;
use reviewscope::sync::groups::GroupSync;
use reviewscope::testing::groups::FakeGroups;

const GROUP: &str = "golang-dev";

fn html(title: &str, messages: &[&str]) -> String {
    let sections: String = messages
        .iter()
        .map(|m| format!("<section><div>{m}</div></section>"))
        .collect();
    format!("<html><head><title>{title} - Google Groups</title></head><body>{sections}</body></html>")
}

fn days_ago(n: i64) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(n)
}

fn fresh() -> (GroupSync<FakeGroups>, CancellationToken) {
    let db = Arc::new(MemStore::new());
    let sync = GroupSync::new(db, FakeGroups::new());
    sync.add(GROUP);
    (sync, CancellationToken::new())
}

#[tokio::test]
async fn crawl_mirrors_conversations_across_days() {
    let (sync, cancel) = fresh();
    sync.client()
        .add_conversation(GROUP, "aaa", days_ago(0), &html("thread a", &["one", "two"]));
    sync.client()
        .add_conversation(GROUP, "bbb", days_ago(3), &html("thread b", &["only"]));

    sync.sync_group(GROUP, &cancel).await.unwrap();

    let convs = sync.conversations(GROUP);
    assert_eq!(convs.len(), 2);
    let (_, a) = convs
        .iter()
        .find(|(url, _)| url.ends_with("/c/aaa"))
        .unwrap();
    assert_eq!(a.title, "thread a");
    assert_eq!(a.messages, vec!["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn conversations_without_messages_are_not_persisted() {
    let (sync, cancel) = fresh();
    sync.client().add_conversation(
        GROUP,
        "broken",
        days_ago(0),
        "<html><body>markup the extractor does not know</body></html>",
    );
    sync.sync_group(GROUP, &cancel).await.unwrap();
    assert!(sync.conversations(GROUP).is_empty());
}

#[tokio::test]
async fn oversized_conversations_drop_trailing_messages() {
    let (sync, cancel) = fresh();
    let big = "x".repeat(300 * 1024);
    let messages: Vec<&str> = vec![&big, &big, &big, &big, &big];
    sync.client()
        .add_conversation(GROUP, "big", days_ago(0), &html("big thread", &messages));

    sync.sync_group(GROUP, &cancel).await.unwrap();

    let convs = sync.conversations(GROUP);
    assert_eq!(convs.len(), 1);
    let (_, conv) = &convs[0];
    // Five 300 KiB messages exceed the 1 MiB value cap; trailing ones
    // are dropped until the record fits.
    assert!(conv.messages.len() < 5);
    assert!(!conv.messages.is_empty());
    assert!(serde_json::to_vec(conv).unwrap().len() <= 1 << 20);
}

#[tokio::test]
async fn incremental_sync_picks_up_new_conversations() {
    let (sync, cancel) = fresh();
    sync.client()
        .add_conversation(GROUP, "old", days_ago(1), &html("old thread", &["hi"]));
    sync.sync_group(GROUP, &cancel).await.unwrap();
    assert_eq!(sync.conversations(GROUP).len(), 1);

    sync.client()
        .add_conversation(GROUP, "new", days_ago(0), &html("new thread", &["hello"]));
    sync.sync_group(GROUP, &cancel).await.unwrap();
    assert_eq!(sync.conversations(GROUP).len(), 2);
}

#[tokio::test]
async fn unchanged_conversations_are_not_rewritten() {
    let (sync, cancel) = fresh();
    sync.client()
        .add_conversation(GROUP, "same", days_ago(0), &html("stable", &["body"]));
    sync.sync_group(GROUP, &cancel).await.unwrap();
    let before = sync.conversations(GROUP);

    sync.sync_group(GROUP, &cancel).await.unwrap();
    let after = sync.conversations(GROUP);
    assert_eq!(before, after);
}
