//! HTTP surface: the approval-surface API, collaborator callbacks and the
//! WebSocket event feed.

pub mod api;
pub mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::{HarvestToml, ServerSection};
use crate::orchestrator::{Collaborators, LoopSettings, Orchestrator};
use crate::store::{DbHandle, HarvestDb};
use api::AppState;

/// Configuration for the harvest server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Allow cross-origin requests, for an approval surface served elsewhere.
    pub permissive_cors: bool,
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            host: section.host.clone(),
            port: section.port,
            db_path: section.db_path.clone(),
            permissive_cors: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSection::default())
    }
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Open the database, wire the collaborators and assemble the shared state.
pub fn build_state(db_path: &std::path::Path, toml: &HarvestToml) -> Result<Arc<AppState>> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = HarvestDb::new(db_path).context("Failed to initialize harvest database")?;
    let collaborators =
        Collaborators::from_config(toml).context("Failed to configure collaborators")?;

    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let orchestrator = Orchestrator::new(
        DbHandle::new(db),
        collaborators,
        LoopSettings::from(toml),
        ws_tx.clone(),
    );
    Ok(Arc::new(AppState { orchestrator, ws_tx }))
}

/// Start the harvest server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig, toml: &HarvestToml) -> Result<()> {
    let state = build_state(&config.db_path, toml)?;
    info!(
        db = %config.db_path.display(),
        search_agent = state.orchestrator.broker().is_available(),
        "harvest state ready"
    );

    let mut app = build_router(state);
    if config.permissive_cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "harvest server listening");
    println!("Harvest running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
