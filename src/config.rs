//! Configuration for the mirror and dashboard
//!
//! Lists the tracked Gerrit projects, GitHub repos and Google groups.
//! Secrets come from the environment; secret storage itself is an
//! external concern.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// One Gerrit instance and its tracked projects.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GerritConfig {
    /// Base URL, e.g. `https://go-review.googlesource.com`.
    pub url: String,
    /// Projects to mirror, e.g. `go`, `tools`.
    #[serde(default)]
    pub projects: Vec<String>,
    /// Basic-auth username; the HTTP password comes from
    /// `REVIEWSCOPE_GERRIT_PASSWORD`.
    #[serde(default)]
    pub username: Option<String>,
}

impl GerritConfig {
    /// Instance name used in store keys: the URL's host.
    pub fn instance(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.url.clone())
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub gerrit: Vec<GerritConfig>,
    /// GitHub repos to mirror, `owner/repo`. The bearer token comes from
    /// `REVIEWSCOPE_GITHUB_TOKEN`.
    #[serde(default)]
    pub github: Vec<String>,
    /// Google groups to mirror, by group name.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| Error::config(format!("bad config: {err}")))
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// The Gerrit HTTP password, if configured in the environment.
    pub fn gerrit_password() -> Option<String> {
        std::env::var("REVIEWSCOPE_GERRIT_PASSWORD").ok()
    }

    /// The GitHub bearer token, if configured in the environment.
    pub fn github_token() -> Option<String> {
        std::env::var("REVIEWSCOPE_GITHUB_TOKEN").ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config() {
        let cfg = Config::from_json(
            r#"{
                "gerrit": [{"url": "https://go-review.googlesource.com", "projects": ["go"]}],
                "github": ["golang/go"],
                "groups": ["golang-dev"]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.gerrit.len(), 1);
        assert_eq!(cfg.gerrit[0].instance(), "go-review.googlesource.com");
        assert_eq!(cfg.github, vec!["golang/go".to_string()]);
        assert_eq!(cfg.groups, vec!["golang-dev".to_string()]);
    }

    #[test]
    fn missing_sections_default_empty() {
        let cfg = Config::from_json("{}").unwrap();
        assert!(cfg.gerrit.is_empty() && cfg.github.is_empty() && cfg.groups.is_empty());
    }

    #[test]
    fn bad_json_is_a_config_error() {
        assert!(matches!(
            Config::from_json("nope"),
            Err(Error::Config { .. })
        ));
    }
}
