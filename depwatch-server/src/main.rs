use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use depwatch_core::RecordingLogger;
use depwatch_server::config::Config;
use depwatch_server::{app, build_event_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting depwatch {}", depwatch_core::service_version());

    let config = Config::from_env().context("Failed to load configuration from environment variables")?;

    let recording_logger = if config.recording_enabled {
        info!("Recording enabled, writing to {}", config.recording_log_path);
        Some(RecordingLogger::new(PathBuf::from(&config.recording_log_path)))
    } else {
        None
    };

    info!(
        "Cloning into {} with scanner timeout {:?}",
        config.workspace_dir.display(),
        config.scanner_timeout
    );

    let router = build_event_router(&config, recording_logger)?;
    let state = Arc::new(AppState {
        router: Arc::new(router),
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
