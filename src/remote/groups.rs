// Google Groups crawler
// Groups exposes no API; conversations are found through day-filtered
// search pages and extracted from their HTML

use std::future::Future;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};

use super::http::client;

const GROUPS_BASE: &str = "https://groups.google.com";

/// The Groups surface the sync engine consumes. Implemented by
/// [`GroupsClient`] and by the in-process double in `testing::groups`.
pub trait GroupsApi: Send + Sync {
    /// Conversation URLs from the search page for the given day window,
    /// most recently updated first. The page shows at most ~30 results.
    fn search(
        &self,
        group: &str,
        before: NaiveDate,
        after: Option<NaiveDate>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Raw HTML of one conversation page.
    fn conversation(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Scraping client for groups.google.com.
pub struct GroupsClient {
    base_url: String,
    http: reqwest::Client,
}

impl GroupsClient {
    pub fn new() -> Result<Self> {
        Ok(GroupsClient {
            base_url: GROUPS_BASE.to_string(),
            http: client()?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    async fn get_text(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::network_with_status(
                format!("Groups returned HTTP {status} for {url}"),
                status.as_u16(),
            ));
        }
        Ok(response.text().await?)
    }
}

impl GroupsApi for GroupsClient {
    async fn search(
        &self,
        group: &str,
        before: NaiveDate,
        after: Option<NaiveDate>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut q = format!("before:{}", before.format("%Y-%m-%d"));
        if let Some(after) = after {
            q.push_str(&format!(" after:{}", after.format("%Y-%m-%d")));
        }
        let url = format!(
            "{}/g/{group}/search?q={}",
            self.base_url,
            urlencode(&q)
        );
        let html = self.get_text(&url, cancel).await?;
        Ok(extract_conversation_links(&self.base_url, group, &html))
    }

    async fn conversation(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        self.get_text(url, cancel).await
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// A conversation extracted from a Groups page: a title plus the visible
/// message sections, in page order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub title: String,
    pub messages: Vec<String>,
}

/// Pull the conversation links out of a search result page. Links are
/// deduplicated in first-seen (most recently updated) order.
pub fn extract_conversation_links(base_url: &str, group: &str, html: &str) -> Vec<String> {
    static LINK_RE: OnceLock<Regex> = OnceLock::new();
    let re = LINK_RE
        .get_or_init(|| Regex::new(r#"/g/([\w.-]+)/c/([A-Za-z0-9_-]+)"#).expect("static regex"));
    let mut seen = Vec::new();
    for caps in re.captures_iter(html) {
        if &caps[1] != group {
            continue;
        }
        let url = format!("{base_url}/g/{group}/c/{}", &caps[2]);
        if !seen.contains(&url) {
            seen.push(url);
        }
    }
    seen
}

/// Extract a conversation from its HTML: the page title plus one entry
/// per `<section>` element, tags stripped and entities decoded.
///
/// Extraction is best-effort; a structural change upstream yields a
/// conversation with zero messages, which callers log and skip.
pub fn extract_conversation(html: &str) -> Conversation {
    static TITLE_RE: OnceLock<Regex> = OnceLock::new();
    static SECTION_RE: OnceLock<Regex> = OnceLock::new();
    let title_re = TITLE_RE
        .get_or_init(|| Regex::new(r"(?s)<title[^>]*>(.*?)</title>").expect("static regex"));
    let section_re = SECTION_RE
        .get_or_init(|| Regex::new(r"(?s)<section[^>]*>(.*?)</section>").expect("static regex"));

    let title = title_re
        .captures(html)
        .map(|c| clean_html_text(&c[1]))
        .map(|t| {
            t.strip_suffix(" - Google Groups")
                .map(str::to_string)
                .unwrap_or(t)
        })
        .unwrap_or_default();

    let messages = section_re
        .captures_iter(html)
        .map(|c| clean_html_text(&c[1]))
        .filter(|m| !m.is_empty())
        .collect();

    Conversation { title, messages }
}

/// Strip tags, decode the common entities, collapse whitespace.
fn clean_html_text(fragment: &str) -> String {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let tag_re = TAG_RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"));
    let text = tag_re.replace_all(fragment, " ");
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_PAGE: &str = r#"
        <html><body>
          <a href="/g/golang-dev/c/AbC123_x">First thread</a>
          <a href="/g/golang-dev/c/AbC123_x">First thread again</a>
          <a href="/g/golang-dev/c/Zz9">Second thread</a>
          <a href="/g/other-group/c/Nope">Foreign thread</a>
        </body></html>"#;

    #[test]
    fn link_extraction_dedups_and_filters_group() {
        let links = extract_conversation_links("https://groups.google.com", "golang-dev", SEARCH_PAGE);
        assert_eq!(
            links,
            vec![
                "https://groups.google.com/g/golang-dev/c/AbC123_x".to_string(),
                "https://groups.google.com/g/golang-dev/c/Zz9".to_string(),
            ]
        );
    }

    #[test]
    fn conversation_extraction() {
        let html = r#"
            <html><head><title>proposal: faster gc - Google Groups</title></head>
            <body>
              <section class="msg"><div>Hello &amp; welcome,<br>this is the <b>first</b> message.</div></section>
              <section><p>Second   message
                 spans lines.</p></section>
              <section><div></div></section>
            </body></html>"#;
        let conv = extract_conversation(html);
        assert_eq!(conv.title, "proposal: faster gc");
        assert_eq!(
            conv.messages,
            vec![
                "Hello & welcome, this is the first message.".to_string(),
                "Second message spans lines.".to_string(),
            ]
        );
    }

    #[test]
    fn empty_page_yields_no_messages() {
        let conv = extract_conversation("<html><body>redesigned markup</body></html>");
        assert!(conv.title.is_empty());
        assert!(conv.messages.is_empty());
    }
}
