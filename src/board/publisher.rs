//! Issue Publisher.
//!
//! Turns a card's issue plan into real tracker issues. Labels named by the
//! plan are created first when missing, then every planned issue is
//! attempted and the resulting references are written back to the card in
//! one patch. Publishing is all-or-nothing on the card side: if any
//! creation fails, every failure is reported in one aggregated error and
//! the card stays unpatched, so a retry re-publishes the whole plan. The
//! tracker side is at-least-once; a retry after partial failure can open
//! duplicate issues. A card that already has issue refs publishes as a
//! no-op.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use super::db::{CardPatch, DbHandle};
use super::extractor::{Artifact, ArtifactKind, extract};
use super::gateway::SessionGateway;
use super::models::{Card, IssuePlan, IssueRef, SoftState};
use super::tracker::{DEFAULT_LABEL_COLOR, IssueTracker};
use crate::errors::BoardError;

const TRANSCRIPT_FETCH_LIMIT: usize = 200;

pub struct IssuePublisher {
    db: DbHandle,
    gateway: Arc<dyn SessionGateway>,
    tracker: Arc<dyn IssueTracker>,
}

impl IssuePublisher {
    pub fn new(
        db: DbHandle,
        gateway: Arc<dyn SessionGateway>,
        tracker: Arc<dyn IssueTracker>,
    ) -> Self {
        Self { db, gateway, tracker }
    }

    /// Publish the card's issue plan to the project tracker.
    pub async fn publish(&self, card_id: i64) -> Result<Card, BoardError> {
        let (card, project) = self
            .db
            .call(move |db| {
                let card = db.get_card(card_id)?;
                let project = match &card {
                    Some(c) => db.get_project(c.project_id)?,
                    None => None,
                };
                Ok((card, project))
            })
            .await?;
        let card = card.ok_or(BoardError::CardNotFound { id: card_id })?;
        let project = project.ok_or(BoardError::ProjectNotFound {
            id: card.project_id,
        })?;

        if card.issue_refs.as_ref().is_some_and(|refs| !refs.is_empty()) {
            // Already published; repeat calls return the card unchanged
            // rather than opening duplicates.
            return Ok(card);
        }

        let repo = project.github_repo.clone().ok_or(BoardError::MissingRepo {
            project_id: project.id,
        })?;

        let plan = self.resolve_plan(&card).await?;

        self.ensure_labels(&repo, &plan).await?;

        // Attempt every planned issue even when one fails, so the caller
        // sees all failures at once instead of one per retry.
        let mut refs = Vec::with_capacity(plan.issues.len());
        let mut failures = Vec::new();
        for issue in &plan.issues {
            match self
                .tracker
                .create_issue(&repo, &issue.title, &issue.body, &issue.labels)
                .await
            {
                Ok(created) => refs.push(IssueRef {
                    number: created.number,
                    url: created.html_url,
                    title: created.title,
                    github_state: created.state,
                    soft_state: SoftState::Open,
                }),
                Err(e) => failures.push(format!("'{}': {:#}", issue.title, e)),
            }
        }
        if !failures.is_empty() {
            return Err(BoardError::Tracker(format!(
                "{} of {} issue creations failed: {}",
                failures.len(),
                plan.issues.len(),
                failures.join("; ")
            )));
        }

        info!(card_id, repo = %repo, issues = refs.len(), "published issue plan");

        let patch = CardPatch::Published {
            issue_plan: plan,
            issue_refs: refs,
        };
        let updated = self
            .db
            .call(move |db| db.apply_patch(card_id, &patch))
            .await?;
        Ok(updated)
    }

    /// The plan to publish: the stored one, or a late harvest from the
    /// plan session's transcript.
    async fn resolve_plan(&self, card: &Card) -> Result<IssuePlan, BoardError> {
        if let Some(plan) = &card.issue_plan {
            return Ok(plan.clone());
        }
        if let Some(session_id) = &card.plan_session_id {
            let entries = self
                .gateway
                .fetch_transcript(session_id, TRANSCRIPT_FETCH_LIMIT)
                .await
                .map_err(BoardError::Provisioning)?;
            if let Some(Artifact::IssuePlan(plan)) = extract(ArtifactKind::IssuePlan, &entries) {
                return Ok(plan);
            }
        }
        Err(BoardError::IssuePlanNotFound)
    }

    /// Create any labels the plan references that the tracker lacks.
    async fn ensure_labels(&self, repo: &str, plan: &IssuePlan) -> Result<(), BoardError> {
        let wanted: BTreeSet<&str> = plan
            .issues
            .iter()
            .flat_map(|i| i.labels.iter())
            .map(String::as_str)
            .filter(|l| !l.is_empty())
            .collect();

        for name in wanted {
            let existing = self
                .tracker
                .get_label(repo, name)
                .await
                .map_err(|e| BoardError::Tracker(format!("{:#}", e)))?;
            if existing.is_none() {
                self.tracker
                    .create_label(repo, name, DEFAULT_LABEL_COLOR)
                    .await
                    .map_err(|e| BoardError::Tracker(format!("{:#}", e)))?;
            }
        }
        Ok(())
    }
}
