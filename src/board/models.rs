use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum length of a card title derived from its body.
pub const TITLE_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub github_repo: Option<String>,
    pub created_at: String,
}

/// A pipeline stage. Cards move between lanes; `done` is terminal and
/// only reachable through the human review gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Todo,
    Plan,
    Build,
    Review,
    Done,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Plan => "plan",
            Self::Build => "build",
            Self::Review => "review",
            Self::Done => "done",
        }
    }

    /// Lanes that require an assigned agent before a card may enter.
    pub fn requires_agent(&self) -> bool {
        matches!(self, Self::Plan | Self::Build | Self::Review)
    }

    pub const ALL: [Lane; 5] = [
        Lane::Todo,
        Lane::Plan,
        Lane::Build,
        Lane::Review,
        Lane::Done,
    ];
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "plan" => Ok(Self::Plan),
            "build" => Ok(Self::Build),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid lane: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HumanReviewStatus {
    Pending,
    Approved,
    ChangesRequested,
}

impl HumanReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
        }
    }
}

impl FromStr for HumanReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "changes_requested" => Ok(Self::ChangesRequested),
            _ => Err(format!("Invalid review status: {}", s)),
        }
    }
}

/// Local close-state of a tracker issue reference, independent of the
/// tracker's own state. Set to `SoftClosed` when a PR lands so the board
/// stops counting the issue as open without mutating the tracker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SoftState {
    Open,
    SoftClosed,
}

impl SoftState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::SoftClosed => "soft_closed",
        }
    }
}

/// One issue the planning agent wants created in the tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedIssue {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Structured plan extracted from a planning session's transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssuePlan {
    pub issues: Vec<PlannedIssue>,
}

/// Reference to an issue created in the external tracker. `github_state`
/// mirrors the tracker at creation time and is never mutated locally;
/// `soft_state` is ours.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueRef {
    pub number: i64,
    pub url: String,
    pub title: String,
    pub github_state: String,
    pub soft_state: SoftState,
}

/// Result of a build session, mined from its transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildResult {
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Isolated git worktree provisioned for build-lane work.
#[derive(Debug, Clone, PartialEq)]
pub struct Worktree {
    pub name: String,
    pub path: String,
    pub branch: String,
}

/// A unit of pipeline work tracked through lanes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,
    pub project_id: i64,
    pub squad_id: i64,
    pub lane: Lane,
    pub position: i32,
    pub title: String,
    pub body: String,
    pub prd_path: Option<String>,
    pub issue_plan: Option<IssuePlan>,
    pub issue_refs: Option<Vec<IssueRef>>,
    pub pr_url: Option<String>,
    pub pr_opened_at: Option<String>,
    pub plan_agent_id: Option<String>,
    pub plan_session_id: Option<String>,
    pub build_agent_id: Option<String>,
    pub build_session_id: Option<String>,
    pub review_agent_id: Option<String>,
    pub review_session_id: Option<String>,
    pub build_worktree_name: Option<String>,
    pub build_worktree_path: Option<String>,
    pub build_branch: Option<String>,
    pub base_branch: Option<String>,
    pub ai_review: Option<serde_json::Value>,
    pub ai_review_session_id: Option<String>,
    pub human_review_status: HumanReviewStatus,
    pub human_review_feedback: Option<String>,
    pub human_reviewed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Card {
    /// The stored session id for a lane, if one was ever created.
    pub fn session_for(&self, lane: Lane) -> Option<&str> {
        match lane {
            Lane::Plan => self.plan_session_id.as_deref(),
            Lane::Build => self.build_session_id.as_deref(),
            Lane::Review => self.review_session_id.as_deref(),
            Lane::Todo | Lane::Done => None,
        }
    }
}

/// Maps (project, squad, lane) to the responsible agent. Maintained by
/// external configuration; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneAssignment {
    pub id: i64,
    pub project_id: i64,
    pub squad_id: i64,
    pub lane: Lane,
    pub agent_id: Option<String>,
}

/// Per-lane card counts for a project, used by the board summary view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneCount {
    pub lane: Lane,
    pub count: i64,
}

/// Derive a card title from its free-text body: first non-empty line,
/// trimmed, capped at [`TITLE_MAX_CHARS`] characters.
pub fn derive_title(body: &str) -> String {
    let first_line = body
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if first_line.is_empty() {
        return "(untitled)".to_string();
    }
    first_line.chars().take(TITLE_MAX_CHARS).collect()
}
