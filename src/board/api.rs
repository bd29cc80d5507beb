use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;

use super::db::DbHandle;
use super::engine::LaneTransitionEngine;
use super::models::{HumanReviewStatus, Lane};
use super::publisher::IssuePublisher;
use super::review::HumanReviewGate;
use super::sync::ArtifactSyncJob;
use crate::errors::BoardError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub engine: LaneTransitionEngine,
    pub sync: ArtifactSyncJob,
    pub publisher: IssuePublisher,
    pub review: HumanReviewGate,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub path: String,
    pub github_repo: Option<String>,
}

#[derive(Deserialize)]
pub struct SetRepoRequest {
    pub github_repo: String,
}

#[derive(Deserialize)]
pub struct CreateCardRequest {
    pub body: String,
    pub squad_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct MoveCardRequest {
    pub lane: String,
}

#[derive(Deserialize)]
pub struct SetAssignmentRequest {
    pub squad_id: Option<i64>,
    pub lane: String,
    pub agent_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ReviewRequest {
    pub status: String,
    pub feedback: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<BoardError> for ApiError {
    fn from(err: BoardError) -> Self {
        match &err {
            BoardError::CardNotFound { .. } | BoardError::ProjectNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            _ if err.is_precondition() => ApiError::Conflict(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route("/api/projects/{id}/repo", put(set_project_repo))
        .route(
            "/api/projects/{id}/cards",
            get(list_cards).post(create_card),
        )
        .route("/api/projects/{id}/lanes", get(lane_counts))
        .route(
            "/api/projects/{id}/assignments",
            get(list_assignments).put(set_assignment),
        )
        .route("/api/cards/{id}", get(get_card))
        .route("/api/cards/{id}/move", post(move_card))
        .route("/api/cards/{id}/sync", post(sync_card))
        .route("/api/cards/{id}/publish", post(publish_card))
        .route("/api/cards/{id}/review", post(review_card))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .db
        .call(move |db| db.create_project(&req.name, &req.path, req.github_repo.as_deref()))
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.db.call(move |db| db.get_project(id)).await?;
    match project {
        Some(project) => Ok(Json(project)),
        None => Err(ApiError::NotFound(format!("Project {} not found", id))),
    }
}

async fn set_project_repo(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<SetRepoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .db
        .call(move |db| db.update_project_repo(id, &req.github_repo))
        .await?;
    Ok(Json(project))
}

async fn create_card(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateCardRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.body.trim().is_empty() {
        return Err(ApiError::BadRequest("Card body must not be empty".into()));
    }
    let squad_id = req.squad_id.unwrap_or(0);
    let card = state
        .db
        .call(move |db| db.create_card(project_id, squad_id, &req.body))
        .await?;
    Ok((StatusCode::CREATED, Json(card)))
}

async fn list_cards(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let cards = state.db.call(move |db| db.list_cards(project_id)).await?;
    Ok(Json(cards))
}

async fn lane_counts(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let counts = state.db.call(move |db| db.lane_counts(project_id)).await?;
    Ok(Json(counts))
}

async fn list_assignments(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let assignments = state
        .db
        .call(move |db| db.list_lane_assignments(project_id))
        .await?;
    Ok(Json(assignments))
}

async fn set_assignment(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Json(req): Json<SetAssignmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let lane = Lane::from_str(&req.lane).map_err(ApiError::BadRequest)?;
    if !lane.requires_agent() {
        return Err(ApiError::BadRequest(format!(
            "Lane '{}' does not take an agent assignment",
            lane
        )));
    }
    let squad_id = req.squad_id.unwrap_or(0);
    let assignments = state
        .db
        .call(move |db| {
            db.set_lane_assignment(project_id, squad_id, lane, req.agent_id.as_deref())?;
            db.list_lane_assignments(project_id)
        })
        .await?;
    Ok(Json(assignments))
}

async fn get_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let card = state.db.call(move |db| db.get_card(id)).await?;
    match card {
        Some(card) => Ok(Json(card)),
        None => Err(ApiError::NotFound(format!("Card {} not found", id))),
    }
}

async fn move_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<MoveCardRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let lane = Lane::from_str(&req.lane).map_err(ApiError::BadRequest)?;
    let card = state.engine.move_card(id, lane).await?;
    Ok(Json(card))
}

async fn sync_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let card = state.sync.sync(id).await?;
    Ok(Json(card))
}

async fn publish_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let card = state.publisher.publish(id).await?;
    Ok((StatusCode::CREATED, Json(card)))
}

async fn review_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ReviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = HumanReviewStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let card = state.review.submit(id, status, req.feedback).await?;
    Ok(Json(card))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::db::BoardDb;
    use crate::board::gateway::{Session, SessionGateway, SessionOptions, TranscriptEntry};
    use crate::board::models::Worktree;
    use crate::board::tracker::{IssueTracker, TrackerIssue, TrackerLabel};
    use crate::board::worktree::{WorktreeProvisioner, worktree_names};
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct StubGateway;

    #[async_trait]
    impl SessionGateway for StubGateway {
        async fn create_or_get(
            &self,
            agent_id: &str,
            _options: SessionOptions,
        ) -> Result<Session> {
            Ok(Session {
                id: format!("sess-{}", agent_id),
                worktree_path: None,
                branch: None,
            })
        }
        async fn send_prompt(&self, _session_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn fetch_transcript(
            &self,
            _session_id: &str,
            _limit: usize,
        ) -> Result<Vec<TranscriptEntry>> {
            Ok(vec![])
        }
    }

    struct StubWorktrees;

    #[async_trait]
    impl WorktreeProvisioner for StubWorktrees {
        async fn ensure(
            &self,
            project_path: &str,
            _base_branch: &str,
            agent_id: &str,
            card_id: i64,
        ) -> Result<Worktree> {
            let (name, branch) = worktree_names(agent_id, card_id);
            Ok(Worktree {
                path: format!("{}/.worktrees/{}", project_path, name),
                name,
                branch,
            })
        }
        async fn default_branch(&self, _project_path: &str) -> Result<String> {
            Ok("main".to_string())
        }
    }

    struct StubTracker;

    #[async_trait]
    impl IssueTracker for StubTracker {
        async fn get_label(&self, _repo: &str, _name: &str) -> Result<Option<TrackerLabel>> {
            Ok(None)
        }
        async fn create_label(
            &self,
            _repo: &str,
            name: &str,
            color: &str,
        ) -> Result<TrackerLabel> {
            Ok(TrackerLabel {
                name: name.to_string(),
                color: color.to_string(),
            })
        }
        async fn create_issue(
            &self,
            _repo: &str,
            title: &str,
            _body: &str,
            _labels: &[String],
        ) -> Result<TrackerIssue> {
            Ok(TrackerIssue {
                number: 1,
                title: title.to_string(),
                state: "open".into(),
                html_url: "https://github.com/acme/demo/issues/1".into(),
            })
        }
    }

    fn test_app() -> Router {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let gateway: Arc<dyn SessionGateway> = Arc::new(StubGateway);
        let worktrees: Arc<dyn WorktreeProvisioner> = Arc::new(StubWorktrees);
        let tracker: Arc<dyn IssueTracker> = Arc::new(StubTracker);
        let state = Arc::new(AppState {
            engine: LaneTransitionEngine::new(
                db.clone(),
                Arc::clone(&gateway),
                Arc::clone(&worktrees),
            ),
            sync: ArtifactSyncJob::new(db.clone(), Arc::clone(&gateway)),
            publisher: IssuePublisher::new(db.clone(), gateway, tracker),
            review: HumanReviewGate::new(db.clone()),
            db,
        });
        api_router().with_state(state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn seed_project(app: &Router) -> i64 {
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/projects",
                serde_json::json!({"name": "demo", "path": "/tmp/demo", "github_repo": "acme/demo"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let project: serde_json::Value = body_json(resp.into_body()).await;
        project["id"].as_i64().unwrap()
    }

    async fn seed_card(app: &Router, project_id: i64) -> i64 {
        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/cards", project_id),
                serde_json::json!({"body": "Fix login bug", "squad_id": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let card: serde_json::Value = body_json(resp.into_body()).await;
        card["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_and_get_project() {
        let app = test_app();
        let id = seed_project(&app).await;

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/projects/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let project: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(project["name"], "demo");
        assert_eq!(project["github_repo"], "acme/demo");
    }

    #[tokio::test]
    async fn test_get_project_not_found() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_card_rejects_empty_body() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let resp = app
            .oneshot(post_json(
                &format!("/api/projects/{}/cards", project_id),
                serde_json::json!({"body": "   "}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_lane_counts_endpoint() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        seed_card(&app, project_id).await;

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/projects/{}/lanes", project_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let counts: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(counts.len(), 5);
        let todo = counts.iter().find(|c| c["lane"] == "todo").unwrap();
        assert_eq!(todo["count"], 1);
    }

    #[tokio::test]
    async fn test_move_without_assignment_conflicts() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let card_id = seed_card(&app, project_id).await;

        let resp = app
            .oneshot(post_json(
                &format!("/api/cards/{}/move", card_id),
                serde_json::json!({"lane": "plan"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_move_to_done_is_forbidden() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let card_id = seed_card(&app, project_id).await;

        let resp = app
            .oneshot(post_json(
                &format!("/api/cards/{}/move", card_id),
                serde_json::json!({"lane": "done"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_move_to_invalid_lane_is_bad_request() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let card_id = seed_card(&app, project_id).await;

        let resp = app
            .oneshot(post_json(
                &format!("/api/cards/{}/move", card_id),
                serde_json::json!({"lane": "shipping"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_assignment_then_move_to_plan() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let card_id = seed_card(&app, project_id).await;

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/api/projects/{}/assignments", project_id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"squad_id": 1, "lane": "plan", "agent_id": "planner"})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(post_json(
                &format!("/api/cards/{}/move", card_id),
                serde_json::json!({"lane": "plan"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let card: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(card["lane"], "plan");
        assert_eq!(card["plan_session_id"], "sess-planner");
        assert!(card["prd_path"].as_str().unwrap().starts_with("docs/prds/"));
    }

    #[tokio::test]
    async fn test_assignment_rejects_terminal_lanes() {
        let app = test_app();
        let project_id = seed_project(&app).await;

        let resp = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/api/projects/{}/assignments", project_id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"lane": "done", "agent_id": "nobody"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_review_with_invalid_status_is_bad_request() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let card_id = seed_card(&app, project_id).await;

        let resp = app
            .oneshot(post_json(
                &format!("/api/cards/{}/review", card_id),
                serde_json::json!({"status": "maybe"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_publish_without_plan_conflicts() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let card_id = seed_card(&app, project_id).await;

        let resp = app
            .oneshot(post_json(
                &format!("/api/cards/{}/publish", card_id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_sync_with_nothing_to_harvest_returns_card() {
        let app = test_app();
        let project_id = seed_project(&app).await;
        let card_id = seed_card(&app, project_id).await;

        let resp = app
            .oneshot(post_json(
                &format!("/api/cards/{}/sync", card_id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let card: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(card["id"], card_id);
        assert!(card["pr_url"].is_null());
    }
}
