// In-process Google Groups double
// Serves fixture-defined conversations through day-filtered search pages

use std::sync::Mutex;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};
use crate::remote::groups::GroupsApi;

use super::fixture;

/// Results per search page, matching the real page's cap.
const SEARCH_PAGE_CAP: usize = 30;

struct FakeConversation {
    group: String,
    url: String,
    updated: NaiveDate,
    html: String,
}

/// Fixture-driven Groups double.
///
/// Fixture sections: `-- conversation <group> <YYYY-MM-DD> <id> --` with
/// the conversation HTML as the body.
#[derive(Default)]
pub struct FakeGroups {
    conversations: Mutex<Vec<FakeConversation>>,
}

impl FakeGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(text: &str) -> Self {
        let fake = Self::new();
        for section in fixture::parse(text) {
            let words = section.words();
            if let ["conversation", group, date, id] = words.as_slice() {
                if let Ok(updated) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                    fake.add_conversation(group, id, updated, &section.body);
                }
            }
        }
        fake
    }

    pub fn add_conversation(&self, group: &str, id: &str, updated: NaiveDate, html: &str) {
        let url = format!("https://groups.google.com/g/{group}/c/{id}");
        let mut conversations = self.conversations.lock().unwrap();
        if let Some(at) = conversations.iter().position(|c| c.url == url) {
            conversations[at].updated = updated;
            conversations[at].html = html.to_string();
        } else {
            conversations.push(FakeConversation {
                group: group.to_string(),
                url,
                updated,
                html: html.to_string(),
            });
        }
    }
}

impl GroupsApi for FakeGroups {
    async fn search(
        &self,
        group: &str,
        before: NaiveDate,
        after: Option<NaiveDate>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let conversations = self.conversations.lock().unwrap();
        let mut hits: Vec<(&NaiveDate, &String)> = conversations
            .iter()
            .filter(|c| c.group == group)
            .filter(|c| c.updated <= before)
            .filter(|c| after.map(|a| c.updated >= a).unwrap_or(true))
            .map(|c| (&c.updated, &c.url))
            .collect();
        // Most recently updated first, like the real search page.
        hits.sort_by(|a, b| b.0.cmp(a.0).then_with(|| a.1.cmp(b.1)));
        Ok(hits
            .into_iter()
            .take(SEARCH_PAGE_CAP)
            .map(|(_, url)| url.clone())
            .collect())
    }

    async fn conversation(&self, url: &str, _cancel: &CancellationToken) -> Result<String> {
        self.conversations
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.url == url)
            .map(|c| c.html.clone())
            .ok_or_else(|| Error::network(format!("no such conversation: {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn search_filters_by_day_window() {
        let fake = FakeGroups::new();
        fake.add_conversation("dev", "a", date("2024-01-01"), "<section>a</section>");
        fake.add_conversation("dev", "b", date("2024-01-05"), "<section>b</section>");
        fake.add_conversation("other", "c", date("2024-01-05"), "<section>c</section>");
        let cancel = CancellationToken::new();

        let hits = fake
            .search("dev", date("2024-01-05"), None, &cancel)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].ends_with("/c/b"));

        let hits = fake
            .search("dev", date("2024-01-04"), Some(date("2024-01-01")), &cancel)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].ends_with("/c/a"));
    }

    #[tokio::test]
    async fn fixture_round_trip() {
        let fake = FakeGroups::from_fixture(
            "-- conversation dev 2024-02-03 xyz --\n<title>T</title><section>hello</section>\n",
        );
        let cancel = CancellationToken::new();
        let hits = fake
            .search("dev", date("2024-02-03"), None, &cancel)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        let html = fake.conversation(&hits[0], &cancel).await.unwrap();
        assert!(html.contains("hello"));
    }
}
