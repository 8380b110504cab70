use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::backup::BackupOrchestrator;
use crate::commands::CommandRegistry;
use crate::log_watcher::LogWatcher;
use crate::{AgentError, AgentResult};

#[derive(Clone)]
pub struct StatusState {
    pub watcher: Arc<LogWatcher>,
    pub backup: Arc<BackupOrchestrator>,
    pub registry: Arc<CommandRegistry>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status(State(state): State<StatusState>) -> Json<Value> {
    // A running tick owns the cursor; report it as busy rather than wait.
    let (log_cursor, log_tick_running) = match state.watcher.try_cursor() {
        Some(cursor) => (cursor, false),
        None => (None, true),
    };
    Json(json!({
        "log_cursor": log_cursor,
        "log_tick_running": log_tick_running,
        "backup_in_progress": state.backup.in_progress(),
        "commands": state.registry.keywords(),
    }))
}

pub async fn serve(bind: &str, state: StatusState) -> AgentResult<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Local HTTP server listening on {}", bind);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| AgentError::InternalError(e.to_string()))
}
