//! Axum trigger surface: manual run, recover-or-run, and execution history.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use harvest_storage::ExecutionStore;
use harvest_sync::{status_message, HarvestRuntime, LaunchError, RunCoordinator};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "harvest-web";

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RunCoordinator>,
    pub executions: Arc<dyn ExecutionStore>,
}

impl AppState {
    pub fn new(coordinator: Arc<RunCoordinator>, executions: Arc<dyn ExecutionStore>) -> Self {
        Self {
            coordinator,
            executions,
        }
    }

    pub fn from_runtime(runtime: &HarvestRuntime) -> Self {
        Self::new(runtime.coordinator.clone(), runtime.executions.clone())
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/v1/harvest", put(run_handler))
        .route("/api/v1/harvest/recover", post(recover_handler))
        .route("/api/v1/executions", get(executions_handler))
        .with_state(Arc::new(state))
}

/// Serve until Ctrl-C; a run in flight is asked to stop after its current chunk.
pub async fn serve(runtime: &HarvestRuntime) -> anyhow::Result<()> {
    let listener = TcpListener::bind(runtime.config.bind_addr.as_str()).await?;
    info!(addr = %runtime.config.bind_addr, "listening");
    let stop = runtime.stop_signal();
    axum::serve(listener, app(AppState::from_runtime(runtime)))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            stop.request_stop();
        })
        .await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.run_now().await {
        Ok(status) => (StatusCode::OK, status_message(status)).into_response(),
        Err(err @ (LaunchError::AlreadyRunning { .. } | LaunchError::AlreadyComplete { .. })) => {
            warn!(error = %err, "manual run refused");
            (StatusCode::CONFLICT, err.to_string()).into_response()
        }
        Err(err) => server_error(err.to_string()),
    }
}

async fn recover_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.recover_or_run().await {
        Some(execution) => Json(execution).into_response(),
        None => server_error("recover-or-run did not launch; see logs".to_string()),
    }
}

async fn executions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state
        .executions
        .find_executions_by_job_name(state.coordinator.job_name(), 0, limit)
        .await
    {
        Ok(executions) => Json(executions).into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

fn server_error(message: String) -> Response {
    error!(%message, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}
