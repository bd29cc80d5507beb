//! Flowboard, an agent-driven Kanban delivery board.
//!
//! ## Overview
//!
//! Cards move through five lanes (`todo → plan → build → review → done`).
//! Each working lane is staffed by an agent: moving a card into the lane
//! provisions what the agent needs (PRD path, git worktree, session),
//! commits the transition, and dispatches a lane instruction. Agents leave
//! machine-tagged artifacts in their transcripts; a sync job harvests them
//! back onto the card. The only way into `done` is explicit human approval.
//!
//! ## Module Map
//!
//! ```text
//! ┌────────┐  HTTP  ┌────────────────────────────────────────────────┐
//! │ Client │ ─────> │  server.rs  (axum Router, ServerConfig)        │
//! └────────┘        │    └─ api.rs  (route handlers, AppState)       │
//!                   │         │                                      │
//!                   │         ├─ engine.rs     move_card()           │
//!                   │         │    ├─ worktree.rs  git worktrees     │
//!                   │         │    ├─ gateway.rs   agent sessions    │
//!                   │         │    └─ prompts.rs   lane instructions │
//!                   │         ├─ sync.rs       transcript harvest    │
//!                   │         │    └─ extractor.rs  tagged blocks    │
//!                   │         ├─ publisher.rs  plan → tracker issues │
//!                   │         │    └─ tracker.rs   GitHub REST       │
//!                   │         └─ review.rs     human review gate     │
//!                   │                                                │
//!                   │  models.rs + db.rs  (SQLite via DbHandle)      │
//!                   └────────────────────────────────────────────────┘
//! ```
//!
//! ## Typical Card Flow
//!
//! 1. `POST /api/cards/{id}/move {"lane": "plan"}` resolves the plan
//!    agent, allocates a `docs/prds/NNN-<slug>.md` path, opens a session,
//!    commits the patch, then prompts the agent to write the PRD and an
//!    `<issue-plan>` block.
//! 2. `POST /api/cards/{id}/sync` harvests the newest `<issue-plan>`,
//!    `<build-result>`, and `<ai-review>` blocks. Writes are
//!    first-write-wins; re-syncing is a no-op.
//! 3. `POST /api/cards/{id}/publish` opens one tracker issue per planned
//!    issue and records the references on the card.
//! 4. Moving to `build` detects the default branch and provisions a
//!    worktree on `squads/<agent>-<card>`; syncing a `<build-result>`
//!    records the PR and soft-closes the card's issue refs.
//! 5. `POST /api/cards/{id}/review {"status": "approved"}` is the human
//!    gate: approval (with a PR on record) moves the card to `done`,
//!    `changes_requested` bounces it back to `build`.

pub mod api;
pub mod db;
pub mod engine;
pub mod extractor;
pub mod gateway;
pub mod models;
pub mod prompts;
pub mod publisher;
pub mod review;
pub mod server;
pub mod sync;
pub mod tracker;
pub mod worktree;
