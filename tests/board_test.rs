// End-to-end dashboard tests
// Mirror via the doubles, compute authorities, score, filter, categorize

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use reviewscope::dashboard::{self, Category};
use reviewscope::preds::{collect_change_preds, defaults};
use reviewscope::review::board;
use reviewscope::review::change::Change;
use reviewscope::storage::kv::MemStore;
use reviewscope::sync::gerrit::GerritSync;
use reviewscope::testing::gerrit::FakeGerrit;

const FIXTURE: &str = r#"
A merged change establishing alice as a maintainer, plus an open change
of hers with one contributor message.

-- change 100 --
{
  "_number": 100,
  "project": "demo",
  "status": "MERGED",
  "subject": "kv: add range scans",
  "meta_rev_id": "m100",
  "created": "2024-01-01 08:00:00.000000000",
  "updated": "2024-01-02 09:00:00.000000000",
  "owner": {"email": "alice@example.com", "name": "Alice"},
  "submitter": {"email": "alice@example.com", "name": "Alice"}
}
-- change 101 --
{
  "_number": 101,
  "project": "demo",
  "status": "NEW",
  "subject": "kv: batch the index writes",
  "meta_rev_id": "m101",
  "created": "2024-02-01 08:00:00.000000000",
  "updated": "2024-02-02 09:00:00.000000000",
  "owner": {"email": "alice@example.com", "name": "Alice"},
  "messages": [
    {"author": {"email": "bob@example.com", "name": "Bob"}, "message": "looks reasonable"}
  ]
}
"#;

async fn mirrored_board() -> Vec<reviewscope::preds::ChangePreds> {
    let db = Arc::new(MemStore::new());
    let sync = GerritSync::new(db, FakeGerrit::from_fixture(FIXTURE), "gerrit.example.com");
    sync.add("demo");
    let cancel = CancellationToken::new();
    sync.sync_project("demo", &cancel).await.unwrap();

    let (_, changes) = board::gerrit_board_changes(&sync, "demo");
    assert_eq!(changes.len(), 2);
    collect_change_preds(
        &cancel,
        changes,
        &defaults::default_predicates(),
        &defaults::default_rejects(),
    )
    .await
}

#[tokio::test]
async fn maintainer_change_scores_eleven_and_submitted_is_rejected() {
    let rows = mirrored_board().await;
    // The merged change is unreviewable; only the open one survives.
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.change.id(), "101");
    assert_eq!(
        row.preds,
        vec![
            "authorMaintainer".to_string(),
            "noMaintainerReviews".to_string()
        ]
    );
    assert_eq!(row.score, 11);
}

#[tokio::test]
async fn dashboard_filter_sees_projected_fields() {
    let rows = mirrored_board().await;

    let kept = dashboard::query("author.authority = maintainer", rows.clone()).unwrap();
    assert_eq!(kept.len(), 1);

    let kept = dashboard::query(r#"reviewed.name:"bob""#, rows.clone()).unwrap();
    assert_eq!(kept.len(), 1);

    let kept = dashboard::query("score > 20", rows.clone()).unwrap();
    assert!(kept.is_empty());

    let kept = dashboard::query(r#"subject:"index""#, rows).unwrap();
    assert_eq!(kept.len(), 1);
}

#[tokio::test]
async fn categories_split_the_board() {
    let rows = mirrored_board().await;
    let categories = vec![
        Category {
            name: "Needs maintainer".to_string(),
            doc: "no maintainer engaged yet".to_string(),
            filter: r#"preds:"noMaintainerReviews""#.to_string(),
        },
        Category {
            name: "Rest".to_string(),
            doc: String::new(),
            filter: String::new(),
        },
    ];
    let split = dashboard::categorize(&categories, rows).unwrap();
    assert_eq!(split[0].rows.len(), 1);
    assert!(split[1].rows.is_empty());
    assert!(split[2].rows.is_empty());

    let text = dashboard::render_text(&split);
    assert!(text.contains("Needs maintainer"));
    assert!(text.contains("101"));
}
