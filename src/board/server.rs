use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::api::{self, AppState};
use super::db::{BoardDb, DbHandle};
use super::engine::LaneTransitionEngine;
use super::gateway::{HttpSessionGateway, SessionGateway};
use super::publisher::IssuePublisher;
use super::review::HumanReviewGate;
use super::sync::ArtifactSyncJob;
use super::tracker::{GitHubTracker, IssueTracker};
use super::worktree::{GitWorktreeProvisioner, WorktreeProvisioner};

/// Configuration for the board server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub runtime_url: String,
    pub runtime_token: Option<String>,
    pub github_token: Option<String>,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4820,
            db_path: PathBuf::from(".flowboard/board.db"),
            runtime_url: "http://127.0.0.1:4821".to_string(),
            runtime_token: None,
            github_token: None,
            dev_mode: false,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Wire the collaborators together into shared state.
pub fn build_state(db: DbHandle, config: &ServerConfig) -> Arc<AppState> {
    let gateway: Arc<dyn SessionGateway> = Arc::new(HttpSessionGateway::new(
        &config.runtime_url,
        config.runtime_token.clone(),
    ));
    let worktrees: Arc<dyn WorktreeProvisioner> = Arc::new(GitWorktreeProvisioner);
    let tracker: Arc<dyn IssueTracker> = Arc::new(GitHubTracker::new(
        config.github_token.as_deref().unwrap_or_default(),
    ));

    Arc::new(AppState {
        engine: LaneTransitionEngine::new(db.clone(), Arc::clone(&gateway), worktrees),
        sync: ArtifactSyncJob::new(db.clone(), Arc::clone(&gateway)),
        publisher: IssuePublisher::new(db.clone(), gateway, tracker),
        review: HumanReviewGate::new(db.clone()),
        db,
    })
}

/// Start the board server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = BoardDb::new(&config.db_path).context("Failed to initialize board database")?;
    let state = build_state(DbHandle::new(db), &config);

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("flowboard running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let state = build_state(db, &ServerConfig::default());
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/api/projects")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"name": "demo", "path": "/tmp/demo"}).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4820);
        assert_eq!(config.db_path, PathBuf::from(".flowboard/board.db"));
        assert!(!config.dev_mode);
    }
}
