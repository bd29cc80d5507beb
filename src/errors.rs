//! Typed error hierarchy for the board core.
//!
//! `BoardError` splits into three families:
//! - precondition errors (`CardNotFound`, `LaneUnassigned`, `Forbidden`,
//!   `MissingPrUrl`, `IssuePlanNotFound`, `MissingRepo`): deterministic,
//!   not retryable, surfaced to the caller verbatim
//! - provisioning errors (`Provisioning`): worktree/session failures;
//!   the card row is guaranteed untouched, so the same call may be retried
//! - store/tracker failures (`Database`, `Tracker`)

use thiserror::Error;

use crate::board::models::Lane;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Card {id} not found")]
    CardNotFound { id: i64 },

    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("No agent assigned for lane '{lane}'")]
    LaneUnassigned { lane: Lane },

    #[error("Forbidden: {0}")]
    Forbidden(&'static str),

    #[error("Card has no pull request URL; approval requires one")]
    MissingPrUrl,

    #[error("No issue plan available on the card or in its plan session")]
    IssuePlanNotFound,

    #[error("Project {project_id} has no tracker repository configured")]
    MissingRepo { project_id: i64 },

    #[error("Provisioning failed: {0:#}")]
    Provisioning(#[source] anyhow::Error),

    #[error("Issue tracker error: {0}")]
    Tracker(String),

    #[error("Database error: {0:#}")]
    Database(#[from] anyhow::Error),
}

impl BoardError {
    /// True for errors that indicate a failed precondition rather than a
    /// transient fault. Callers should not retry these.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::CardNotFound { .. }
                | Self::ProjectNotFound { .. }
                | Self::LaneUnassigned { .. }
                | Self::Forbidden(_)
                | Self::MissingPrUrl
                | Self::IssuePlanNotFound
                | Self::MissingRepo { .. }
        )
    }
}
