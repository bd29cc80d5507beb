//! Lane Transition Engine.
//!
//! `move_card` validates the requested lane, resolves the responsible
//! agent, provisions lane prerequisites (PRD path, default branch,
//! worktree, session), persists the merged card patch as one atomic write,
//! and only then dispatches the lane instruction to the session as a
//! detached task. Ordering inside a single call is fixed: provisioning,
//! then persistence, then dispatch. If provisioning fails the card row is
//! left untouched.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::db::{CardPatch, DbHandle};
use super::gateway::{SessionGateway, SessionOptions};
use super::models::{Card, Lane, Project, Worktree};
use super::prompts;
use super::worktree::WorktreeProvisioner;
use crate::errors::BoardError;

/// Directory of planning documents, relative to the project root.
pub const PRD_DIR: &str = "docs/prds";

const PRD_SLUG_MAX: usize = 48;

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    slug.chars()
        .take(max_len)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

/// Allocate the next sequential PRD path for a card: scan the project's
/// PRD directory for the highest `NNN-` filename prefix and use the next
/// number, zero-padded to 3 digits. Returns a path relative to the
/// project root.
pub fn allocate_prd_path(project_path: &str, title: &str, card_id: i64) -> Result<String> {
    let dir = Path::new(project_path).join(PRD_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create PRD directory {}", dir.display()))?;

    let mut max_seq: u32 = 0;
    for entry in std::fs::read_dir(&dir).context("Failed to read PRD directory")? {
        let entry = entry.context("Failed to read PRD directory entry")?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((prefix, _)) = name.split_once('-') else {
            continue;
        };
        if prefix.len() == 3
            && let Ok(seq) = prefix.parse::<u32>()
        {
            max_seq = max_seq.max(seq);
        }
    }

    let mut slug = slugify(title, PRD_SLUG_MAX);
    if slug.is_empty() {
        slug = format!("card-{}", card_id);
    }
    Ok(format!("{}/{:03}-{}.md", PRD_DIR, max_seq + 1, slug))
}

/// Lane-specific preparation computed before the transactional write.
/// One variant per lane keeps the patch shape a compile-time-checked
/// property of the lane.
#[derive(Debug)]
enum LanePrep {
    Plan {
        agent_id: String,
        prd_path: String,
    },
    Build {
        agent_id: String,
        base_branch: String,
        worktree: Worktree,
    },
    Review {
        agent_id: String,
        base_branch: String,
    },
}

pub struct LaneTransitionEngine {
    db: DbHandle,
    gateway: Arc<dyn SessionGateway>,
    worktrees: Arc<dyn WorktreeProvisioner>,
}

impl LaneTransitionEngine {
    pub fn new(
        db: DbHandle,
        gateway: Arc<dyn SessionGateway>,
        worktrees: Arc<dyn WorktreeProvisioner>,
    ) -> Self {
        Self {
            db,
            gateway,
            worktrees,
        }
    }

    /// Move a card to a target lane.
    ///
    /// - `todo` is a pure state write, always allowed
    /// - `plan` / `build` / `review` require a lane assignment and
    ///   provision a session (plus a worktree for `build`) before the write
    /// - `done` is always rejected; the human review gate owns that lane
    pub async fn move_card(&self, card_id: i64, target: Lane) -> Result<Card, BoardError> {
        let (card, project) = self.load_card_and_project(card_id).await?;

        match target {
            Lane::Done => Err(BoardError::Forbidden(
                "cards reach done only through human review approval",
            )),
            Lane::Todo => {
                let updated = self
                    .db
                    .call(move |db| db.apply_patch(card_id, &CardPatch::Todo))
                    .await?;
                Ok(updated)
            }
            Lane::Plan | Lane::Build | Lane::Review => {
                let agent_id = self
                    .db
                    .call({
                        let (project_id, squad_id) = (card.project_id, card.squad_id);
                        move |db| db.get_lane_agent(project_id, squad_id, target)
                    })
                    .await?
                    .ok_or(BoardError::LaneUnassigned { lane: target })?;

                let prep = self.prepare_lane(&card, &project, target, agent_id).await?;
                let session_id = self.ensure_session(&card, target, &prep).await?;
                let patch = build_patch(prep, session_id);

                let updated = self
                    .db
                    .call(move |db| db.apply_patch(card_id, &patch))
                    .await?;

                self.dispatch_prompt(&updated, target);
                Ok(updated)
            }
        }
    }

    async fn load_card_and_project(&self, card_id: i64) -> Result<(Card, Project), BoardError> {
        let card = self
            .db
            .call(move |db| db.get_card(card_id))
            .await?
            .ok_or(BoardError::CardNotFound { id: card_id })?;
        let project_id = card.project_id;
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await?
            .ok_or(BoardError::ProjectNotFound { id: project_id })?;
        Ok((card, project))
    }

    /// Compute lane-specific preparation. Pure lookups plus git/filesystem
    /// side effects; the card row is not touched here.
    async fn prepare_lane(
        &self,
        card: &Card,
        project: &Project,
        target: Lane,
        agent_id: String,
    ) -> Result<LanePrep, BoardError> {
        match target {
            Lane::Plan => {
                // Re-entering plan keeps the existing PRD path. Allocation
                // scans the PRD directory, so it runs on the blocking pool.
                let prd_path = match &card.prd_path {
                    Some(path) => path.clone(),
                    None => {
                        let (path, title, id) =
                            (project.path.clone(), card.title.clone(), card.id);
                        tokio::task::spawn_blocking(move || {
                            allocate_prd_path(&path, &title, id)
                        })
                        .await
                        .context("PRD allocation task panicked")
                        .map_err(BoardError::Provisioning)?
                        .map_err(BoardError::Provisioning)?
                    }
                };
                Ok(LanePrep::Plan { agent_id, prd_path })
            }
            Lane::Build => {
                let base_branch = self
                    .worktrees
                    .default_branch(&project.path)
                    .await
                    .map_err(BoardError::Provisioning)?;
                let worktree = self
                    .worktrees
                    .ensure(&project.path, &base_branch, &agent_id, card.id)
                    .await
                    .map_err(BoardError::Provisioning)?;
                Ok(LanePrep::Build {
                    agent_id,
                    base_branch,
                    worktree,
                })
            }
            Lane::Review => {
                // Review inherits the build's base branch when present.
                let base_branch = match &card.base_branch {
                    Some(branch) => branch.clone(),
                    None => self
                        .worktrees
                        .default_branch(&project.path)
                        .await
                        .map_err(BoardError::Provisioning)?,
                };
                Ok(LanePrep::Review {
                    agent_id,
                    base_branch,
                })
            }
            Lane::Todo | Lane::Done => unreachable!("prepare_lane called for {}", target),
        }
    }

    /// Reuse the lane's stored session or create one through the gateway.
    /// Build sessions are created inside the provisioned worktree.
    async fn ensure_session(
        &self,
        card: &Card,
        target: Lane,
        prep: &LanePrep,
    ) -> Result<String, BoardError> {
        if let Some(existing) = card.session_for(target) {
            return Ok(existing.to_string());
        }

        let (agent_id, options) = match prep {
            LanePrep::Plan { agent_id, .. } => (
                agent_id,
                SessionOptions {
                    title: format!("card-{} plan: {}", card.id, card.title),
                    ..Default::default()
                },
            ),
            LanePrep::Build {
                agent_id, worktree, ..
            } => (
                agent_id,
                SessionOptions {
                    title: format!("card-{} build: {}", card.id, card.title),
                    worktree_path: Some(worktree.path.clone()),
                    branch: Some(worktree.branch.clone()),
                },
            ),
            LanePrep::Review { agent_id, .. } => (
                agent_id,
                SessionOptions {
                    title: format!("card-{} review: {}", card.id, card.title),
                    worktree_path: card.build_worktree_path.clone(),
                    branch: card.build_branch.clone(),
                },
            ),
        };

        let session = self
            .gateway
            .create_or_get(agent_id, options)
            .await
            .map_err(BoardError::Provisioning)?;
        Ok(session.id)
    }

    /// Fire the lane instruction at the session. Detached from the caller:
    /// a slow or failing runtime never blocks the transition and never
    /// rolls back the committed card state.
    fn dispatch_prompt(&self, card: &Card, target: Lane) {
        let Some(session_id) = card.session_for(target).map(str::to_string) else {
            return;
        };
        let text = match target {
            Lane::Plan => prompts::plan_prompt(card),
            Lane::Build => prompts::build_prompt(card),
            Lane::Review => prompts::review_prompt(card),
            Lane::Todo | Lane::Done => return,
        };
        let gateway = Arc::clone(&self.gateway);
        let card_id = card.id;
        tokio::spawn(async move {
            if let Err(e) = gateway.send_prompt(&session_id, &text).await {
                tracing::warn!(
                    card_id,
                    session_id = %session_id,
                    lane = %target,
                    "failed to dispatch lane prompt: {:#}",
                    e
                );
            }
        });
    }
}

fn build_patch(prep: LanePrep, session_id: String) -> CardPatch {
    match prep {
        LanePrep::Plan { agent_id, prd_path } => CardPatch::Plan {
            prd_path,
            agent_id,
            session_id,
        },
        LanePrep::Build {
            agent_id,
            base_branch,
            worktree,
        } => CardPatch::Build {
            base_branch,
            agent_id,
            session_id,
            worktree_name: worktree.name,
            worktree_path: worktree.path,
            branch: worktree.branch,
        },
        LanePrep::Review {
            agent_id,
            base_branch,
        } => CardPatch::Review {
            base_branch,
            agent_id,
            session_id,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Fix Login Bug", 40), "fix-login-bug");
        assert_eq!(slugify("  spaces   and--dashes ", 40), "spaces-and-dashes");
        assert_eq!(slugify("Émile's café", 40), "émile-s-café");
    }

    #[test]
    fn test_slugify_truncates_without_trailing_dash() {
        assert_eq!(slugify("one two three", 7), "one-two");
        assert_eq!(slugify("one two three", 8), "one-two");
    }

    #[test]
    fn test_slugify_empty() {
        assert_eq!(slugify("!!!", 40), "");
    }

    #[test]
    fn test_allocate_prd_path_starts_at_001() {
        let tmp = tempfile::tempdir().unwrap();
        let path =
            allocate_prd_path(tmp.path().to_str().unwrap(), "Fix login bug", 1).unwrap();
        assert_eq!(path, "docs/prds/001-fix-login-bug.md");
    }

    #[test]
    fn test_allocate_prd_path_continues_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(PRD_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("001-foo.md"), "").unwrap();
        std::fs::write(dir.join("002-bar.md"), "").unwrap();

        let path = allocate_prd_path(tmp.path().to_str().unwrap(), "Baz", 9).unwrap();
        assert_eq!(path, "docs/prds/003-baz.md");
    }

    #[test]
    fn test_allocate_prd_path_ignores_non_sequence_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(PRD_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("README.md"), "").unwrap();
        std::fs::write(dir.join("005-real.md"), "").unwrap();
        std::fs::write(dir.join("12-short-prefix.md"), "").unwrap();

        let path = allocate_prd_path(tmp.path().to_str().unwrap(), "Next", 9).unwrap();
        assert_eq!(path, "docs/prds/006-next.md");
    }

    #[test]
    fn test_allocate_prd_path_slug_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let path = allocate_prd_path(tmp.path().to_str().unwrap(), "???", 42).unwrap();
        assert_eq!(path, "docs/prds/001-card-42.md");
    }

    #[test]
    fn test_allocate_prd_path_caps_slug_length() {
        let tmp = tempfile::tempdir().unwrap();
        let long_title = "word ".repeat(30);
        let path = allocate_prd_path(tmp.path().to_str().unwrap(), &long_title, 1).unwrap();
        let file = path.strip_prefix("docs/prds/001-").unwrap();
        let slug = file.strip_suffix(".md").unwrap();
        assert!(slug.chars().count() <= 48);
        assert!(!slug.ends_with('-'));
    }
}
