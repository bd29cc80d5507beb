use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the board database.
///
/// Wraps `BoardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. The mutex also makes each store
/// call atomic with respect to every other; concurrent writers to the same
/// card resolve as last-committed-write-wins.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardDb>>,
}

impl DbHandle {
    pub fn new(db: BoardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BoardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct BoardDb {
    conn: Connection,
}

/// Fields written when a card changes lane or receives artifacts. Each
/// variant maps to exactly one SQL statement batch executed atomically,
/// so a card is either fully transitioned or untouched.
#[derive(Debug, Clone)]
pub enum CardPatch {
    /// Pure lane write, no side-effect fields. Used for `todo`.
    Todo,
    Plan {
        prd_path: String,
        agent_id: String,
        session_id: String,
    },
    Build {
        base_branch: String,
        agent_id: String,
        session_id: String,
        worktree_name: String,
        worktree_path: String,
        branch: String,
    },
    Review {
        base_branch: String,
        agent_id: String,
        session_id: String,
    },
    /// Artifact reconciliation from a sync pass. Absent sub-patches leave
    /// their columns untouched.
    Sync(SyncPatch),
    /// Result of publishing the plan to the tracker.
    Published {
        issue_plan: IssuePlan,
        issue_refs: Vec<IssueRef>,
    },
    /// Outcome of the human review gate.
    HumanReview {
        lane: Lane,
        status: HumanReviewStatus,
        feedback: Option<String>,
        reviewed_at: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SyncPatch {
    pub issue_plan: Option<IssuePlan>,
    pub build: Option<BuildPatch>,
    pub ai_review: Option<AiReviewPatch>,
}

impl SyncPatch {
    pub fn is_empty(&self) -> bool {
        self.issue_plan.is_none() && self.build.is_none() && self.ai_review.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct BuildPatch {
    pub pr_url: String,
    pub pr_opened_at: String,
    /// Existing refs with their `soft_state` flipped to soft-closed.
    /// `None` when the card has no refs to update.
    pub issue_refs: Option<Vec<IssueRef>>,
}

#[derive(Debug, Clone)]
pub struct AiReviewPatch {
    pub review: serde_json::Value,
    pub session_id: String,
}

impl BoardDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    github_repo TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS cards (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    squad_id INTEGER NOT NULL DEFAULT 0,
                    lane TEXT NOT NULL DEFAULT 'todo',
                    position INTEGER NOT NULL DEFAULT 0,
                    title TEXT NOT NULL,
                    body TEXT NOT NULL DEFAULT '',
                    prd_path TEXT,
                    issue_plan TEXT,
                    issue_refs TEXT,
                    pr_url TEXT,
                    pr_opened_at TEXT,
                    plan_agent_id TEXT,
                    plan_session_id TEXT,
                    build_agent_id TEXT,
                    build_session_id TEXT,
                    review_agent_id TEXT,
                    review_session_id TEXT,
                    build_worktree_name TEXT,
                    build_worktree_path TEXT,
                    build_branch TEXT,
                    base_branch TEXT,
                    ai_review TEXT,
                    ai_review_session_id TEXT,
                    human_review_status TEXT NOT NULL DEFAULT 'pending',
                    human_review_feedback TEXT,
                    human_reviewed_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS lane_assignments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    squad_id INTEGER NOT NULL DEFAULT 0,
                    lane TEXT NOT NULL,
                    agent_id TEXT,
                    UNIQUE(project_id, squad_id, lane)
                );

                CREATE INDEX IF NOT EXISTS idx_cards_project ON cards(project_id);
                CREATE INDEX IF NOT EXISTS idx_cards_lane ON cards(project_id, lane);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (nullable columns, safe to re-run). Only
        // "duplicate column" errors are ignored; anything else propagates.
        match self
            .conn
            .execute("ALTER TABLE cards ADD COLUMN base_branch TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add base_branch column: {}", e)),
        }

        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(
        &self,
        name: &str,
        path: &str,
        github_repo: Option<&str>,
    ) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, path, github_repo) VALUES (?1, ?2, ?3)",
                params![name, path, github_repo],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, path, github_repo, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        path: row.get(2)?,
                        github_repo: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn update_project_repo(&self, id: i64, github_repo: &str) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET github_repo = ?1 WHERE id = ?2",
                params![github_repo, id],
            )
            .context("Failed to update project github_repo")?;
        self.get_project(id)?
            .context("Project not found after repo update")
    }

    // ── Lane assignments ──────────────────────────────────────────────

    /// Upsert the responsible agent for a (project, squad, lane) slot.
    /// `None` clears the slot, which blocks transitions into that lane.
    pub fn set_lane_assignment(
        &self,
        project_id: i64,
        squad_id: i64,
        lane: Lane,
        agent_id: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO lane_assignments (project_id, squad_id, lane, agent_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(project_id, squad_id, lane)
                 DO UPDATE SET agent_id = excluded.agent_id",
                params![project_id, squad_id, lane.as_str(), agent_id],
            )
            .context("Failed to upsert lane assignment")?;
        Ok(())
    }

    /// The agent responsible for a lane, or `None` when the slot is
    /// missing or explicitly unassigned.
    pub fn get_lane_agent(
        &self,
        project_id: i64,
        squad_id: i64,
        lane: Lane,
    ) -> Result<Option<String>> {
        let agent: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT agent_id FROM lane_assignments
                 WHERE project_id = ?1 AND squad_id = ?2 AND lane = ?3",
                params![project_id, squad_id, lane.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query lane assignment")?;
        Ok(agent.flatten())
    }

    pub fn list_lane_assignments(&self, project_id: i64) -> Result<Vec<LaneAssignment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, squad_id, lane, agent_id
                 FROM lane_assignments WHERE project_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_lane_assignments")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .context("Failed to query lane assignments")?;
        let mut out = Vec::new();
        for row in rows {
            let (id, project_id, squad_id, lane, agent_id) =
                row.context("Failed to read lane assignment row")?;
            out.push(LaneAssignment {
                id,
                project_id,
                squad_id,
                lane: Lane::from_str(&lane).map_err(|e| anyhow::anyhow!(e))?,
                agent_id,
            });
        }
        Ok(out)
    }

    // ── Card CRUD ─────────────────────────────────────────────────────

    /// Create a card in lane `todo` from free-text body. Title is derived
    /// from the first non-empty line.
    pub fn create_card(&self, project_id: i64, squad_id: i64, body: &str) -> Result<Card> {
        let title = derive_title(body);
        let max_pos: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM cards
                 WHERE project_id = ?1 AND lane = 'todo'",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to get max position")?;

        self.conn
            .execute(
                "INSERT INTO cards (project_id, squad_id, title, body, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![project_id, squad_id, title, body, max_pos + 1],
            )
            .context("Failed to insert card")?;
        let id = self.conn.last_insert_rowid();
        self.get_card(id)?.context("Card not found after insert")
    }

    pub fn get_card(&self, id: i64) -> Result<Option<Card>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM cards WHERE id = ?1", CARD_COLUMNS),
                params![id],
                map_card_row,
            )
            .optional()
            .context("Failed to query card")?;
        row.map(CardRow::into_card).transpose()
    }

    pub fn list_cards(&self, project_id: i64) -> Result<Vec<Card>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM cards WHERE project_id = ?1 ORDER BY lane, position",
                CARD_COLUMNS
            ))
            .context("Failed to prepare list_cards")?;
        let rows = stmt
            .query_map(params![project_id], map_card_row)
            .context("Failed to query cards")?;
        let mut cards = Vec::new();
        for row in rows {
            cards.push(row.context("Failed to read card row")?.into_card()?);
        }
        Ok(cards)
    }

    /// Card counts per lane for a project. Lanes with no cards are
    /// included with a zero count.
    pub fn lane_counts(&self, project_id: i64) -> Result<Vec<LaneCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT lane, COUNT(*) FROM cards WHERE project_id = ?1 GROUP BY lane",
            )
            .context("Failed to prepare lane_counts")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query lane counts")?;
        let mut by_lane = std::collections::HashMap::new();
        for row in rows {
            let (lane, count) = row.context("Failed to read lane count row")?;
            let lane = Lane::from_str(&lane).map_err(|e| anyhow::anyhow!(e))?;
            by_lane.insert(lane, count);
        }
        Ok(Lane::ALL
            .iter()
            .map(|lane| LaneCount {
                lane: *lane,
                count: by_lane.get(lane).copied().unwrap_or(0),
            })
            .collect())
    }

    /// Apply a patch to a card as one atomic write and return the updated
    /// row. This is the engine's atomicity boundary: provisioning happens
    /// before this call, dispatch after it.
    pub fn apply_patch(&self, card_id: i64, patch: &CardPatch) -> Result<Card> {
        match patch {
            CardPatch::Todo => {
                self.conn.execute(
                    "UPDATE cards SET lane = 'todo', updated_at = datetime('now')
                     WHERE id = ?1",
                    params![card_id],
                )?;
            }
            CardPatch::Plan {
                prd_path,
                agent_id,
                session_id,
            } => {
                self.conn.execute(
                    "UPDATE cards SET lane = 'plan', prd_path = ?1,
                        plan_agent_id = ?2, plan_session_id = ?3,
                        updated_at = datetime('now')
                     WHERE id = ?4",
                    params![prd_path, agent_id, session_id, card_id],
                )?;
            }
            CardPatch::Build {
                base_branch,
                agent_id,
                session_id,
                worktree_name,
                worktree_path,
                branch,
            } => {
                self.conn.execute(
                    "UPDATE cards SET lane = 'build', base_branch = ?1,
                        build_agent_id = ?2, build_session_id = ?3,
                        build_worktree_name = ?4, build_worktree_path = ?5,
                        build_branch = ?6, updated_at = datetime('now')
                     WHERE id = ?7",
                    params![
                        base_branch,
                        agent_id,
                        session_id,
                        worktree_name,
                        worktree_path,
                        branch,
                        card_id
                    ],
                )?;
            }
            CardPatch::Review {
                base_branch,
                agent_id,
                session_id,
            } => {
                self.conn.execute(
                    "UPDATE cards SET lane = 'review', base_branch = ?1,
                        review_agent_id = ?2, review_session_id = ?3,
                        updated_at = datetime('now')
                     WHERE id = ?4",
                    params![base_branch, agent_id, session_id, card_id],
                )?;
            }
            CardPatch::Sync(sync) => {
                // All sub-patches commit together or not at all.
                let tx = self
                    .conn
                    .unchecked_transaction()
                    .context("Failed to open sync transaction")?;
                if let Some(plan) = &sync.issue_plan {
                    tx.execute(
                        "UPDATE cards SET issue_plan = ?1, updated_at = datetime('now')
                         WHERE id = ?2",
                        params![serde_json::to_string(plan)?, card_id],
                    )?;
                }
                if let Some(build) = &sync.build {
                    let refs_json = build
                        .issue_refs
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?;
                    tx.execute(
                        "UPDATE cards SET pr_url = ?1, pr_opened_at = ?2,
                            issue_refs = COALESCE(?3, issue_refs),
                            updated_at = datetime('now')
                         WHERE id = ?4",
                        params![build.pr_url, build.pr_opened_at, refs_json, card_id],
                    )?;
                }
                if let Some(review) = &sync.ai_review {
                    tx.execute(
                        "UPDATE cards SET ai_review = ?1, ai_review_session_id = ?2,
                            human_review_status = 'pending',
                            human_review_feedback = NULL, human_reviewed_at = NULL,
                            updated_at = datetime('now')
                         WHERE id = ?3",
                        params![
                            serde_json::to_string(&review.review)?,
                            review.session_id,
                            card_id
                        ],
                    )?;
                }
                tx.commit().context("Failed to commit sync patch")?;
            }
            CardPatch::Published {
                issue_plan,
                issue_refs,
            } => {
                self.conn.execute(
                    "UPDATE cards SET issue_plan = ?1, issue_refs = ?2,
                        updated_at = datetime('now')
                     WHERE id = ?3",
                    params![
                        serde_json::to_string(issue_plan)?,
                        serde_json::to_string(issue_refs)?,
                        card_id
                    ],
                )?;
            }
            CardPatch::HumanReview {
                lane,
                status,
                feedback,
                reviewed_at,
            } => {
                self.conn.execute(
                    "UPDATE cards SET lane = ?1, human_review_status = ?2,
                        human_review_feedback = ?3, human_reviewed_at = ?4,
                        updated_at = datetime('now')
                     WHERE id = ?5",
                    params![
                        lane.as_str(),
                        status.as_str(),
                        feedback,
                        reviewed_at,
                        card_id
                    ],
                )?;
            }
        }
        self.get_card(card_id)?
            .with_context(|| format!("Card {} not found after patch", card_id))
    }
}

const CARD_COLUMNS: &str = "id, project_id, squad_id, lane, position, title, body, prd_path, \
     issue_plan, issue_refs, pr_url, pr_opened_at, \
     plan_agent_id, plan_session_id, build_agent_id, build_session_id, \
     review_agent_id, review_session_id, \
     build_worktree_name, build_worktree_path, build_branch, base_branch, \
     ai_review, ai_review_session_id, \
     human_review_status, human_review_feedback, human_reviewed_at, \
     created_at, updated_at";

/// Raw card row; JSON/enum columns are decoded in `into_card`.
struct CardRow {
    id: i64,
    project_id: i64,
    squad_id: i64,
    lane: String,
    position: i32,
    title: String,
    body: String,
    prd_path: Option<String>,
    issue_plan: Option<String>,
    issue_refs: Option<String>,
    pr_url: Option<String>,
    pr_opened_at: Option<String>,
    plan_agent_id: Option<String>,
    plan_session_id: Option<String>,
    build_agent_id: Option<String>,
    build_session_id: Option<String>,
    review_agent_id: Option<String>,
    review_session_id: Option<String>,
    build_worktree_name: Option<String>,
    build_worktree_path: Option<String>,
    build_branch: Option<String>,
    base_branch: Option<String>,
    ai_review: Option<String>,
    ai_review_session_id: Option<String>,
    human_review_status: String,
    human_review_feedback: Option<String>,
    human_reviewed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn map_card_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CardRow> {
    Ok(CardRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        squad_id: row.get(2)?,
        lane: row.get(3)?,
        position: row.get(4)?,
        title: row.get(5)?,
        body: row.get(6)?,
        prd_path: row.get(7)?,
        issue_plan: row.get(8)?,
        issue_refs: row.get(9)?,
        pr_url: row.get(10)?,
        pr_opened_at: row.get(11)?,
        plan_agent_id: row.get(12)?,
        plan_session_id: row.get(13)?,
        build_agent_id: row.get(14)?,
        build_session_id: row.get(15)?,
        review_agent_id: row.get(16)?,
        review_session_id: row.get(17)?,
        build_worktree_name: row.get(18)?,
        build_worktree_path: row.get(19)?,
        build_branch: row.get(20)?,
        base_branch: row.get(21)?,
        ai_review: row.get(22)?,
        ai_review_session_id: row.get(23)?,
        human_review_status: row.get(24)?,
        human_review_feedback: row.get(25)?,
        human_reviewed_at: row.get(26)?,
        created_at: row.get(27)?,
        updated_at: row.get(28)?,
    })
}

impl CardRow {
    fn into_card(self) -> Result<Card> {
        Ok(Card {
            id: self.id,
            project_id: self.project_id,
            squad_id: self.squad_id,
            lane: Lane::from_str(&self.lane).map_err(|e| anyhow::anyhow!(e))?,
            position: self.position,
            title: self.title,
            body: self.body,
            prd_path: self.prd_path,
            issue_plan: self
                .issue_plan
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Invalid issue_plan JSON in store")?,
            issue_refs: self
                .issue_refs
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Invalid issue_refs JSON in store")?,
            pr_url: self.pr_url,
            pr_opened_at: self.pr_opened_at,
            plan_agent_id: self.plan_agent_id,
            plan_session_id: self.plan_session_id,
            build_agent_id: self.build_agent_id,
            build_session_id: self.build_session_id,
            review_agent_id: self.review_agent_id,
            review_session_id: self.review_session_id,
            build_worktree_name: self.build_worktree_name,
            build_worktree_path: self.build_worktree_path,
            build_branch: self.build_branch,
            base_branch: self.base_branch,
            ai_review: self
                .ai_review
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Invalid ai_review JSON in store")?,
            ai_review_session_id: self.ai_review_session_id,
            human_review_status: HumanReviewStatus::from_str(&self.human_review_status)
                .map_err(|e| anyhow::anyhow!(e))?,
            human_review_feedback: self.human_review_feedback,
            human_reviewed_at: self.human_reviewed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
