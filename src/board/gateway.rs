//! Session Gateway: the seam between the board and the agent runtime.
//!
//! The engine never talks to the runtime directly; it goes through the
//! [`SessionGateway`] trait so tests can substitute a recording double.
//! The production implementation is a thin REST client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque reference to an agent work-session. The board stores the id
/// and never interprets the runtime's internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Options for creating (or re-attaching to) a session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionOptions {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// One message in a session's transcript, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub text: String,
}

#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// Create a session for the agent, or return the existing one the
    /// runtime already holds for this (agent, title) pair.
    async fn create_or_get(&self, agent_id: &str, options: SessionOptions) -> Result<Session>;

    /// Deliver an instruction to the session. Callers treat this as
    /// fire-and-forget; the board never blocks a transition on it.
    async fn send_prompt(&self, session_id: &str, text: &str) -> Result<()>;

    /// Fetch up to `limit` transcript entries, oldest first.
    async fn fetch_transcript(&self, session_id: &str, limit: usize)
    -> Result<Vec<TranscriptEntry>>;
}

/// REST client for an agent-runtime daemon.
pub struct HttpSessionGateway {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpSessionGateway {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("User-Agent", "flowboard");
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }
}

#[async_trait]
impl SessionGateway for HttpSessionGateway {
    async fn create_or_get(&self, agent_id: &str, options: SessionOptions) -> Result<Session> {
        let url = format!("{}/api/agents/{}/sessions", self.base_url, agent_id);
        self.request(self.client.post(&url))
            .json(&options)
            .send()
            .await
            .context("Failed to send session create request")?
            .error_for_status()
            .context("Agent runtime rejected session create")?
            .json::<Session>()
            .await
            .context("Failed to parse session response")
    }

    async fn send_prompt(&self, session_id: &str, text: &str) -> Result<()> {
        let url = format!("{}/api/sessions/{}/prompt", self.base_url, session_id);
        self.request(self.client.post(&url))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .context("Failed to send prompt request")?
            .error_for_status()
            .context("Agent runtime rejected prompt")?;
        Ok(())
    }

    async fn fetch_transcript(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<TranscriptEntry>> {
        let url = format!("{}/api/sessions/{}/transcript", self.base_url, session_id);
        self.request(self.client.get(&url))
            .query(&[("limit", limit.to_string())])
            .send()
            .await
            .context("Failed to send transcript request")?
            .error_for_status()
            .context("Agent runtime rejected transcript fetch")?
            .json::<Vec<TranscriptEntry>>()
            .await
            .context("Failed to parse transcript response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_options_skip_absent_fields() {
        let opts = SessionOptions {
            title: "card #1 plan".into(),
            worktree_path: None,
            branch: None,
        };
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json.get("title").unwrap(), "card #1 plan");
        assert!(json.get("worktree_path").is_none());
        assert!(json.get("branch").is_none());
    }

    #[test]
    fn test_session_deserialize_minimal() {
        let session: Session = serde_json::from_str(r#"{"id":"sess-1"}"#).unwrap();
        assert_eq!(session.id, "sess-1");
        assert!(session.worktree_path.is_none());
    }

    #[test]
    fn test_base_url_trailing_slash_is_stripped() {
        let gw = HttpSessionGateway::new("http://localhost:4100/", None);
        assert_eq!(gw.base_url, "http://localhost:4100");
    }
}
