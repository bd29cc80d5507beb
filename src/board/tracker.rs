//! Issue tracker client. Only the contract the board needs: label lookup,
//! label creation, issue creation against an `owner/repo` slug.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Color given to labels the board has to create itself.
pub const DEFAULT_LABEL_COLOR: &str = "ededed";

/// A tracker label (subset of fields we care about).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerLabel {
    pub name: String,
    #[serde(default)]
    pub color: String,
}

/// A tracker issue (subset of fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub number: i64,
    pub title: String,
    pub state: String,
    pub html_url: String,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Fetch a label by name; `None` when the tracker has no such label.
    async fn get_label(&self, repo: &str, name: &str) -> Result<Option<TrackerLabel>>;

    async fn create_label(&self, repo: &str, name: &str, color: &str) -> Result<TrackerLabel>;

    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<TrackerIssue>;
}

/// GitHub REST implementation.
pub struct GitHubTracker {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl GitHubTracker {
    pub fn new(token: &str) -> Self {
        Self::with_api_base("https://api.github.com", token)
    }

    /// Point the client at a different API host (GitHub Enterprise, tests).
    pub fn with_api_base(api_base: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "flowboard")
            .header("Accept", "application/vnd.github+json")
    }
}

#[async_trait]
impl IssueTracker for GitHubTracker {
    async fn get_label(&self, repo: &str, name: &str) -> Result<Option<TrackerLabel>> {
        let url = format!("{}/repos/{}/labels/{}", self.api_base, repo, name);
        let resp = self
            .request(self.client.get(&url))
            .send()
            .await
            .context("Failed to send label request to GitHub")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let label = resp
            .error_for_status()
            .context("GitHub label API returned error status")?
            .json::<TrackerLabel>()
            .await
            .context("Failed to parse label response from GitHub")?;
        Ok(Some(label))
    }

    async fn create_label(&self, repo: &str, name: &str, color: &str) -> Result<TrackerLabel> {
        let url = format!("{}/repos/{}/labels", self.api_base, repo);
        self.request(self.client.post(&url))
            .json(&serde_json::json!({ "name": name, "color": color }))
            .send()
            .await
            .context("Failed to send label create request to GitHub")?
            .error_for_status()
            .context("GitHub label create returned error status")?
            .json::<TrackerLabel>()
            .await
            .context("Failed to parse created label from GitHub")
    }

    async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<TrackerIssue> {
        let url = format!("{}/repos/{}/issues", self.api_base, repo);
        self.request(self.client.post(&url))
            .json(&serde_json::json!({ "title": title, "body": body, "labels": labels }))
            .send()
            .await
            .context("Failed to send issue create request to GitHub")?
            .error_for_status()
            .context("GitHub issue create returned error status")?
            .json::<TrackerIssue>()
            .await
            .context("Failed to parse created issue from GitHub")
    }
}
