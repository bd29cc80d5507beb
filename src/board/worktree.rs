//! Worktree Provisioner: isolated git working directories for build work.
//!
//! Build-lane transitions get a dedicated worktree + branch named after the
//! responsible agent and the card (`squads/<agent-slug>-<card-id>`), so the
//! agent session starts inside it. Git is shelled out, never linked; every
//! subprocess is wrapped in a timeout and an expiry is treated as a
//! provisioning failure rather than left to hang.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use super::engine::slugify;
use super::models::Worktree;

const GIT_WORKTREE_TIMEOUT: Duration = Duration::from_secs(30);
const GIT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait WorktreeProvisioner: Send + Sync {
    /// Ensure a worktree + branch exists for (agent, card) off `base_branch`.
    /// Idempotent: an existing worktree directory is reused as-is.
    async fn ensure(
        &self,
        project_path: &str,
        base_branch: &str,
        agent_id: &str,
        card_id: i64,
    ) -> Result<Worktree>;

    /// Detect the repository's default branch (origin HEAD, falling back
    /// to the locally checked-out branch).
    async fn default_branch(&self, project_path: &str) -> Result<String>;
}

/// Production provisioner backed by the `git` CLI.
pub struct GitWorktreeProvisioner;

/// The branch and directory names derived for a (agent, card) pair.
pub fn worktree_names(agent_id: &str, card_id: i64) -> (String, String) {
    let name = format!("{}-{}", slugify(agent_id, 30), card_id);
    let branch = format!("squads/{}", name);
    (name, branch)
}

async fn run_git(
    project_path: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<std::process::Output> {
    let fut = Command::new("git")
        .args(args)
        .current_dir(project_path)
        .output();
    match tokio::time::timeout(timeout, fut).await {
        Ok(output) => output.with_context(|| format!("Failed to run git {}", args.join(" "))),
        Err(_) => bail!(
            "git {} timed out after {}s",
            args.join(" "),
            timeout.as_secs()
        ),
    }
}

#[async_trait]
impl WorktreeProvisioner for GitWorktreeProvisioner {
    async fn ensure(
        &self,
        project_path: &str,
        base_branch: &str,
        agent_id: &str,
        card_id: i64,
    ) -> Result<Worktree> {
        let (name, branch) = worktree_names(agent_id, card_id);
        let worktree_path = PathBuf::from(project_path).join(".worktrees").join(&name);

        if worktree_path.is_dir() {
            // Re-entering build for the same card reuses the worktree.
            return Ok(Worktree {
                name,
                path: worktree_path.to_string_lossy().into_owned(),
                branch,
            });
        }

        let parent = worktree_path
            .parent()
            .context("Worktree path has no parent directory")?;
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create .worktrees directory")?;

        let worktree_str = worktree_path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;

        let output = run_git(
            project_path,
            &["worktree", "add", "-B", &branch, worktree_str, base_branch],
            GIT_WORKTREE_TIMEOUT,
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git worktree add failed for {}: {}",
                branch,
                stderr.trim()
            );
        }

        Ok(Worktree {
            name,
            path: worktree_str.to_string(),
            branch,
        })
    }

    async fn default_branch(&self, project_path: &str) -> Result<String> {
        // origin HEAD first: "origin/main" -> "main"
        let output = run_git(
            project_path,
            &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
            GIT_QUERY_TIMEOUT,
        )
        .await?;
        if output.status.success() {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if let Some(branch) = name.strip_prefix("origin/")
                && !branch.is_empty()
            {
                return Ok(branch.to_string());
            }
        }

        // No origin HEAD (fresh clone, local-only repo): use the current branch.
        let output = run_git(
            project_path,
            &["rev-parse", "--abbrev-ref", "HEAD"],
            GIT_QUERY_TIMEOUT,
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Failed to detect default branch: {}", stderr.trim());
        }
        let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if branch.is_empty() || branch == "HEAD" {
            bail!("Repository has no usable default branch (detached HEAD?)");
        }
        Ok(branch)
    }
}
