pub mod auth;
pub mod config;
pub mod github;
pub mod pipeline;
pub mod reconciler;
pub mod recording;
pub mod signature;
pub mod webhook;
pub mod workspace;

use anyhow::Result;
use axum::{response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use auth::{InstallationAuthenticator, InstallationToken, TokenSource};
pub use config::Config;
pub use github::{GitHubClient, IssueTracker, RepositoryName};
pub use pipeline::{EventRouter, RunOutcome};
pub use reconciler::IssueReconciler;
pub use workspace::{GitCli, RepositoryFetcher, WorkspaceManager};

use depwatch_core::report::REPORT_HEADING;
use depwatch_core::{default_scanners, RecordingLogger};

pub struct AppState {
    pub router: Arc<EventRouter>,
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "depwatch",
        "version": depwatch_core::service_version(),
    }))
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(webhook::webhook_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Wire the production collaborators together from configuration.
pub fn build_event_router(
    config: &Config,
    recording_logger: Option<RecordingLogger>,
) -> Result<EventRouter> {
    let http = github::create_github_client(recording_logger.clone())?;

    let tokens = InstallationAuthenticator::new(
        http.clone(),
        config.github_api_url.clone(),
        config.github_app_id,
        config.github_private_key.clone(),
    );
    let tracker = GitHubClient::new(http, config.github_api_url.clone());

    Ok(EventRouter::new(
        signature::SignatureVerifier::new(config.github_webhook_secret.clone()),
        Arc::new(tokens),
        WorkspaceManager::new(config.workspace_dir.clone(), Arc::new(GitCli)),
        default_scanners(config.scanner_timeout),
        IssueReconciler::new(
            Arc::new(tracker),
            REPORT_HEADING,
            config.tracking_label.clone(),
        ),
        recording_logger,
    ))
}
