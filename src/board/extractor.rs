//! Artifact extraction from session transcripts.
//!
//! Agents emit machine-tagged blocks in their output:
//! - `<issue-plan>{ "issues": [...] }</issue-plan>`
//! - `<build-result>{ "pr_url": "..." }</build-result>`
//! - `<ai-review>{ ... }</ai-review>`
//!
//! `extract` is a pure function over transcript entries: no I/O, so it can
//! be unit-tested against literal fixtures. A missing artifact is a normal
//! outcome (`None`), not an error. Malformed blocks are skipped and older
//! blocks are still considered.

use std::sync::LazyLock;

use regex::Regex;

use super::gateway::TranscriptEntry;
use super::models::{BuildResult, IssuePlan};

static ISSUE_PLAN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<issue-plan>\s*(.*?)\s*</issue-plan>").unwrap());

static BUILD_RESULT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<build-result>\s*(.*?)\s*</build-result>").unwrap());

static AI_REVIEW_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<ai-review>\s*(.*?)\s*</ai-review>").unwrap());

/// Which artifact a lane's session is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    IssuePlan,
    BuildResult,
    AiReview,
}

/// A validated artifact mined from a transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    IssuePlan(IssuePlan),
    BuildResult(BuildResult),
    AiReview(serde_json::Value),
}

/// Scan the transcript for the most recent well-formed block of the
/// requested kind.
pub fn extract(kind: ArtifactKind, entries: &[TranscriptEntry]) -> Option<Artifact> {
    let regex = match kind {
        ArtifactKind::IssuePlan => &*ISSUE_PLAN_REGEX,
        ArtifactKind::BuildResult => &*BUILD_RESULT_REGEX,
        ArtifactKind::AiReview => &*AI_REVIEW_REGEX,
    };

    // Newest entry first; within an entry, the last block wins.
    for entry in entries.iter().rev() {
        let mut blocks: Vec<&str> = regex
            .captures_iter(&entry.text)
            .filter_map(|cap| cap.get(1))
            .map(|m| m.as_str())
            .collect();
        while let Some(block) = blocks.pop() {
            if let Some(artifact) = parse_block(kind, block) {
                return Some(artifact);
            }
        }
    }
    None
}

fn parse_block(kind: ArtifactKind, block: &str) -> Option<Artifact> {
    match kind {
        ArtifactKind::IssuePlan => {
            let plan: IssuePlan = serde_json::from_str(block).ok()?;
            if plan.issues.is_empty() {
                return None;
            }
            Some(Artifact::IssuePlan(plan))
        }
        ArtifactKind::BuildResult => {
            let result: BuildResult = serde_json::from_str(block).ok()?;
            Some(Artifact::BuildResult(result))
        }
        ArtifactKind::AiReview => {
            let value: serde_json::Value = serde_json::from_str(block).ok()?;
            // A review must be structured, not a bare scalar.
            value.is_object().then_some(Artifact::AiReview(value))
        }
    }
}
