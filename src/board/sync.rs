//! Artifact Sync Job.
//!
//! Re-reads each lane's session transcript on demand and reconciles any
//! new artifact into the card. Every patch is first-write-wins: an
//! existing `issue_plan`, `pr_url`, or `ai_review` is never clobbered by a
//! stale re-sync, which makes the job idempotent and safe to run on a
//! timer or on demand.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};

use super::db::{AiReviewPatch, BuildPatch, CardPatch, DbHandle, SyncPatch};
use super::extractor::{Artifact, ArtifactKind, extract};
use super::gateway::SessionGateway;
use super::models::{Card, Lane, SoftState};
use crate::errors::BoardError;

/// How much transcript to pull per session on each sync pass.
const TRANSCRIPT_FETCH_LIMIT: usize = 200;

pub struct ArtifactSyncJob {
    db: DbHandle,
    gateway: Arc<dyn SessionGateway>,
}

impl ArtifactSyncJob {
    pub fn new(db: DbHandle, gateway: Arc<dyn SessionGateway>) -> Self {
        Self { db, gateway }
    }

    /// Reconcile all pending artifacts for a card. A no-op when nothing
    /// new was produced; an extraction miss is not an error.
    pub async fn sync(&self, card_id: i64) -> Result<Card, BoardError> {
        let card = self
            .db
            .call(move |db| db.get_card(card_id))
            .await?
            .ok_or(BoardError::CardNotFound { id: card_id })?;

        let mut patch = SyncPatch::default();

        if card.issue_plan.is_none()
            && let Some(artifact) = self.extract_from(&card, Lane::Plan).await?
            && let Artifact::IssuePlan(plan) = artifact
        {
            patch.issue_plan = Some(plan);
        }

        if card.pr_url.is_none()
            && let Some(Artifact::BuildResult(result)) =
                self.extract_from(&card, Lane::Build).await?
            && let Some(pr_url) = result.pr_url.filter(|url| !url.is_empty())
        {
            patch.build = Some(BuildPatch {
                pr_url,
                pr_opened_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                issue_refs: soft_close_refs(&card),
            });
        }

        if card.ai_review.is_none()
            && let Some(session_id) = card.review_session_id.clone()
            && let Some(Artifact::AiReview(review)) =
                self.extract_from(&card, Lane::Review).await?
        {
            patch.ai_review = Some(AiReviewPatch { review, session_id });
        }

        if patch.is_empty() {
            return Ok(card);
        }

        let updated = self
            .db
            .call(move |db| db.apply_patch(card_id, &CardPatch::Sync(patch)))
            .await?;
        Ok(updated)
    }

    /// Fetch the lane's transcript and run the extractor for its artifact
    /// kind. Unset sessions are skipped.
    async fn extract_from(
        &self,
        card: &Card,
        lane: Lane,
    ) -> Result<Option<Artifact>, BoardError> {
        let Some(session_id) = card.session_for(lane) else {
            return Ok(None);
        };
        let kind = match lane {
            Lane::Plan => ArtifactKind::IssuePlan,
            Lane::Build => ArtifactKind::BuildResult,
            Lane::Review => ArtifactKind::AiReview,
            Lane::Todo | Lane::Done => return Ok(None),
        };
        let entries = self
            .gateway
            .fetch_transcript(session_id, TRANSCRIPT_FETCH_LIMIT)
            .await
            .map_err(BoardError::Provisioning)?;
        Ok(extract(kind, &entries))
    }
}

/// Existing issue refs with `soft_state` flipped to soft-closed. Their
/// tracker-reported state is left untouched.
fn soft_close_refs(card: &Card) -> Option<Vec<super::models::IssueRef>> {
    card.issue_refs.as_ref().map(|refs| {
        refs.iter()
            .map(|r| {
                let mut r = r.clone();
                r.soft_state = SoftState::SoftClosed;
                r
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::db::BoardDb;
    use crate::board::gateway::{Session, SessionOptions, TranscriptEntry};
    use crate::board::models::{HumanReviewStatus, IssuePlan, IssueRef, PlannedIssue};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Gateway double serving canned transcripts per session id.
    struct CannedGateway {
        transcripts: HashMap<String, Vec<TranscriptEntry>>,
    }

    impl CannedGateway {
        fn new(entries: &[(&str, &str)]) -> Arc<Self> {
            let transcripts = entries
                .iter()
                .map(|(session, text)| {
                    (
                        session.to_string(),
                        vec![TranscriptEntry {
                            role: "assistant".to_string(),
                            text: text.to_string(),
                        }],
                    )
                })
                .collect();
            Arc::new(Self { transcripts })
        }
    }

    #[async_trait]
    impl SessionGateway for CannedGateway {
        async fn create_or_get(
            &self,
            _agent_id: &str,
            _options: SessionOptions,
        ) -> Result<Session> {
            unreachable!("sync never creates sessions")
        }

        async fn send_prompt(&self, _session_id: &str, _text: &str) -> Result<()> {
            unreachable!("sync never sends prompts")
        }

        async fn fetch_transcript(
            &self,
            session_id: &str,
            _limit: usize,
        ) -> Result<Vec<TranscriptEntry>> {
            Ok(self.transcripts.get(session_id).cloned().unwrap_or_default())
        }
    }

    async fn seed_card(db: &DbHandle) -> Card {
        db.call(|db| {
            let project = db.create_project("demo", "/tmp/demo", None)?;
            db.create_card(project.id, 1, "Fix login bug")
        })
        .await
        .unwrap()
    }

    async fn attach_sessions(db: &DbHandle, card_id: i64) -> Card {
        // Route the card through plan and build so sessions are on record.
        db.call(move |db| {
            db.apply_patch(
                card_id,
                &CardPatch::Plan {
                    prd_path: "docs/prds/001-x.md".into(),
                    agent_id: "planner".into(),
                    session_id: "sess-plan".into(),
                },
            )?;
            db.apply_patch(
                card_id,
                &CardPatch::Build {
                    base_branch: "main".into(),
                    agent_id: "builder".into(),
                    session_id: "sess-build".into(),
                    worktree_name: "builder-1".into(),
                    worktree_path: "/tmp/demo/.worktrees/builder-1".into(),
                    branch: "squads/builder-1".into(),
                },
            )?;
            db.apply_patch(
                card_id,
                &CardPatch::Review {
                    base_branch: "main".into(),
                    agent_id: "reviewer".into(),
                    session_id: "sess-review".into(),
                },
            )
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_sync_harvests_all_three_artifacts() {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let card = seed_card(&db).await;
        attach_sessions(&db, card.id).await;

        let gateway = CannedGateway::new(&[
            (
                "sess-plan",
                r#"<issue-plan>{"issues":[{"title":"Add API"}]}</issue-plan>"#,
            ),
            (
                "sess-build",
                r#"<build-result>{"pr_url":"https://x/pull/5"}</build-result>"#,
            ),
            (
                "sess-review",
                r#"<ai-review>{"verdict":"approve"}</ai-review>"#,
            ),
        ]);
        let job = ArtifactSyncJob::new(db, gateway);

        let synced = job.sync(card.id).await.unwrap();
        assert_eq!(synced.issue_plan.as_ref().unwrap().issues.len(), 1);
        assert_eq!(synced.pr_url.as_deref(), Some("https://x/pull/5"));
        assert!(synced.pr_opened_at.is_some());
        assert_eq!(synced.ai_review.unwrap()["verdict"], "approve");
        assert_eq!(synced.ai_review_session_id.as_deref(), Some("sess-review"));
        assert_eq!(synced.human_review_status, HumanReviewStatus::Pending);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let card = seed_card(&db).await;
        attach_sessions(&db, card.id).await;

        let gateway = CannedGateway::new(&[(
            "sess-build",
            r#"<build-result>{"pr_url":"https://x/pull/5"}</build-result>"#,
        )]);
        let job = ArtifactSyncJob::new(db, gateway);

        let first = job.sync(card.id).await.unwrap();
        let second = job.sync(card.id).await.unwrap();
        assert_eq!(first.pr_url, second.pr_url);
        // Timestamp is sticky too: the second pass is a no-op.
        assert_eq!(first.pr_opened_at, second.pr_opened_at);
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn test_sync_never_overwrites_existing_plan() {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let card = seed_card(&db).await;
        attach_sessions(&db, card.id).await;

        let original = IssuePlan {
            issues: vec![PlannedIssue {
                title: "Published plan".into(),
                body: String::new(),
                labels: vec![],
            }],
        };
        let card_id = card.id;
        let plan = original.clone();
        db.call(move |db| {
            db.apply_patch(
                card_id,
                &CardPatch::Sync(SyncPatch {
                    issue_plan: Some(plan),
                    ..Default::default()
                }),
            )
        })
        .await
        .unwrap();

        let gateway = CannedGateway::new(&[(
            "sess-plan",
            r#"<issue-plan>{"issues":[{"title":"Newer plan"}]}</issue-plan>"#,
        )]);
        let job = ArtifactSyncJob::new(db, gateway);

        let synced = job.sync(card.id).await.unwrap();
        assert_eq!(synced.issue_plan, Some(original));
    }

    #[tokio::test]
    async fn test_pr_url_soft_closes_refs_without_touching_tracker_state() {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let card = seed_card(&db).await;
        attach_sessions(&db, card.id).await;

        let refs = vec![IssueRef {
            number: 11,
            url: "https://github.com/acme/demo/issues/11".into(),
            title: "Add API".into(),
            github_state: "open".into(),
            soft_state: SoftState::Open,
        }];
        let card_id = card.id;
        let plan = IssuePlan {
            issues: vec![PlannedIssue {
                title: "Add API".into(),
                body: String::new(),
                labels: vec![],
            }],
        };
        db.call(move |db| {
            db.apply_patch(
                card_id,
                &CardPatch::Published {
                    issue_plan: plan,
                    issue_refs: refs,
                },
            )
        })
        .await
        .unwrap();

        let gateway = CannedGateway::new(&[(
            "sess-build",
            r#"<build-result>{"pr_url":"https://x/pull/9"}</build-result>"#,
        )]);
        let job = ArtifactSyncJob::new(db, gateway);

        let synced = job.sync(card.id).await.unwrap();
        let refs = synced.issue_refs.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].soft_state, SoftState::SoftClosed);
        assert_eq!(refs[0].github_state, "open");
    }

    #[tokio::test]
    async fn test_sync_with_no_sessions_is_a_noop() {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let card = seed_card(&db).await;
        let gateway = CannedGateway::new(&[]);
        let job = ArtifactSyncJob::new(db, gateway);

        let synced = job.sync(card.id).await.unwrap();
        assert!(synced.issue_plan.is_none());
        assert!(synced.pr_url.is_none());
        assert!(synced.ai_review.is_none());
    }

    #[tokio::test]
    async fn test_empty_pr_url_is_not_applied() {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let card = seed_card(&db).await;
        attach_sessions(&db, card.id).await;

        let gateway = CannedGateway::new(&[(
            "sess-build",
            r#"<build-result>{"pr_url":"","summary":"still working"}</build-result>"#,
        )]);
        let job = ArtifactSyncJob::new(db, gateway);

        let synced = job.sync(card.id).await.unwrap();
        assert!(synced.pr_url.is_none());
        assert!(synced.pr_opened_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_card_errors() {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let gateway = CannedGateway::new(&[]);
        let job = ArtifactSyncJob::new(db, gateway);
        let err = job.sync(999).await.unwrap_err();
        assert!(matches!(err, BoardError::CardNotFound { id: 999 }));
    }
}
