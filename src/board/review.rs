//! Human Review Gate.
//!
//! The only way a card reaches the done lane. A human verdict either
//! approves the card (requires a recorded pull request) or requests
//! changes, which sends the card back to build while keeping its sessions
//! and worktree intact.

use chrono::{SecondsFormat, Utc};

use super::db::{CardPatch, DbHandle};
use super::models::{Card, HumanReviewStatus, Lane};
use crate::errors::BoardError;

pub struct HumanReviewGate {
    db: DbHandle,
}

impl HumanReviewGate {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Record a human verdict on a card under review.
    ///
    /// Approval moves the card to done and requires a pull request URL on
    /// record. Requesting changes moves it back to build. `Pending` is not
    /// a verdict a human can submit.
    pub async fn submit(
        &self,
        card_id: i64,
        status: HumanReviewStatus,
        feedback: Option<String>,
    ) -> Result<Card, BoardError> {
        let target = match status {
            HumanReviewStatus::Approved => Lane::Done,
            HumanReviewStatus::ChangesRequested => Lane::Build,
            HumanReviewStatus::Pending => {
                return Err(BoardError::Forbidden("pending is not a review verdict"));
            }
        };

        let card = self
            .db
            .call(move |db| db.get_card(card_id))
            .await?
            .ok_or(BoardError::CardNotFound { id: card_id })?;

        if status == HumanReviewStatus::Approved
            && card.pr_url.as_deref().is_none_or(str::is_empty)
        {
            return Err(BoardError::MissingPrUrl);
        }

        let patch = CardPatch::HumanReview {
            lane: target,
            status,
            feedback,
            reviewed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let updated = self
            .db
            .call(move |db| db.apply_patch(card_id, &patch))
            .await?;
        Ok(updated)
    }
}
