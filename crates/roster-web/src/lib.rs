//! Axum JSON surface for the schedule sync admin screen.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use roster_core::{FieldChange, LogPage, LogQuery, DEFAULT_PAGE_SIZE};
use roster_storage::{RunLogStore, StoreError};
use roster_sync::{
    ConfigReply, RunNowReply, SchedulerError, SyncConfig, SyncRuntime, SyncScheduler, SyncStatus,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-web";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: SyncScheduler,
    pub logs: Arc<dyn RunLogStore>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(%status, error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidInterval(_) => Self::BadRequest(err.to_string()),
            SchedulerError::Persist(_) => Self::Internal(err.to_string()),
            SchedulerError::Stopped => Self::Unavailable(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/sync/status", get(status_handler))
        .route("/api/sync/run", post(run_handler))
        .route("/api/sync/config", put(config_handler))
        .route("/api/sync/logs", get(logs_handler))
        .route("/api/sync/runs/{run_id}/changes", get(run_changes_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding HTTP listener on port {port}"))?;
    info!(port, "roster web listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;
    Ok(())
}

/// Connects and migrates, then starts the scheduler and serves until Ctrl-C.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let port = config.port;
    let runtime = SyncRuntime::connect(config).await?;
    runtime.migrate().await?;
    let scheduler = SyncScheduler::start(
        runtime.scheduler_deps(),
        runtime.config.scheduler_options(),
    )
    .await;
    let state = AppState {
        scheduler: scheduler.clone(),
        logs: Arc::clone(&runtime.logs),
    };
    let served = serve(state, port).await;
    scheduler.shutdown().await;
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not listen for shutdown signal");
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<SyncStatus> {
    Json(state.scheduler.status())
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Result<Json<RunNowReply>, ApiError> {
    Ok(Json(state.scheduler.run_now().await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigBody {
    #[serde(default)]
    interval_minutes: Option<i64>,
    #[serde(default)]
    enabled: Option<bool>,
}

async fn config_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ConfigBody>, JsonRejection>,
) -> Result<Json<ConfigReply>, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let reply = state
        .scheduler
        .configure(
            body.interval_minutes.unwrap_or(0),
            body.enabled.unwrap_or(false),
        )
        .await?;
    Ok(Json(reply))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsParams {
    page: Option<u32>,
    page_size: Option<u32>,
    /// Older clients ask for the newest `limit` rows.
    limit: Option<u32>,
    with_changes: Option<bool>,
    before: Option<i64>,
}

impl LogsParams {
    fn into_query(self) -> LogQuery {
        LogQuery {
            page: self.page.unwrap_or(1),
            page_size: self.page_size.or(self.limit).unwrap_or(DEFAULT_PAGE_SIZE),
            before_id: self.before,
            only_with_changes: self.with_changes.unwrap_or(false),
        }
        .normalized()
    }
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogsParams>,
) -> Result<Json<LogPage>, ApiError> {
    let page = state.logs.query(params.into_query()).await?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunChanges {
    run_id: Uuid,
    timestamp: DateTime<Utc>,
    success: bool,
    changes: Vec<FieldChange>,
}

async fn run_changes_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunChanges>, ApiError> {
    let run_id = Uuid::parse_str(&run_id)
        .map_err(|_| ApiError::BadRequest(format!("invalid run id {run_id:?}")))?;
    let entry = state
        .logs
        .find_by_run_id(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no sync run {run_id}")))?;
    Ok(Json(RunChanges {
        run_id,
        timestamp: entry.run.timestamp,
        success: entry.run.success,
        changes: entry.run.changes,
    }))
}
