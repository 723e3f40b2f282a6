//! Routes and handlers for the observer API.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::engine::{Engine, TaskFilter};
use crate::error::{ErrorBody, ErrorCode, RunnerError};
use crate::types::{ExecutionLog, NewTask, Priority, StatusChange, SystemState, Task, TaskId};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    engine: Arc<Engine>,
}

impl ApiState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Error wrapper that renders as `{code, message}` with a matching status.
#[derive(Debug)]
pub struct ApiError(RunnerError);

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        Self(err)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::TaskNotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidTransition
        | ErrorCode::NoActiveTask
        | ErrorCode::RunnerBusy
        | ErrorCode::QueueEmpty => StatusCode::CONFLICT,
        ErrorCode::CancelTimedOut => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::AgentError => StatusCode::BAD_GATEWAY,
        ErrorCode::KillFailed | ErrorCode::RecoveryExhausted | ErrorCode::StoreError => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody::from(&self.0);
        let status = status_for(body.code);
        if status.is_server_error() {
            tracing::error!(code = ?body.code, message = %body.message, "Request failed");
        } else {
            debug!(code = ?body.code, message = %body.message, "Request rejected");
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn api_state(State(state): State<ApiState>) -> Json<SystemState> {
    Json(state.engine.snapshot())
}

/// Event stream. The first event is a `SNAPSHOT`; the stream ends when the
/// subscription is dropped for falling behind.
async fn api_events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.engine.subscribe();
    let snapshot = state.engine.snapshot();
    debug!(observer = subscription.id(), "Observer attached");

    let head = stream::once(async move { Event::default().event("SNAPSHOT").json_data(snapshot) });
    let events = subscription
        .into_stream()
        .map(|event| Event::default().event(event.kind()).json_data(&event));

    Sse::new(head.chain(events)).keep_alive(KeepAlive::default())
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Comma-separated statuses.
    pub status: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

impl ListQuery {
    fn into_filter(self) -> Result<TaskFilter, RunnerError> {
        let statuses = match self.status.as_deref() {
            None | Some("") => Vec::new(),
            Some(list) => list
                .split(',')
                .map(|s| s.trim().parse())
                .collect::<Result<Vec<_>, String>>()
                .map_err(|e| RunnerError::invalid("status", e))?,
        };
        Ok(TaskFilter {
            statuses,
            include_archived: self.include_archived,
        })
    }
}

async fn list_tasks(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Task>> {
    let filter = query.into_filter()?;
    Ok(Json(state.engine.list(&filter)?))
}

async fn create_task(
    State(state): State<ApiState>,
    Json(new): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.engine.submit(new).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(State(state): State<ApiState>, Path(id): Path<TaskId>) -> ApiResult<Task> {
    Ok(Json(state.engine.task(id)?))
}

async fn delete_task(State(state): State<ApiState>, Path(id): Path<TaskId>) -> ApiResult<Task> {
    Ok(Json(state.engine.delete(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub after: Option<i64>,
    pub limit: Option<usize>,
}

async fn task_logs(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Vec<ExecutionLog>> {
    Ok(Json(state.engine.logs(id, query.after, query.limit)?))
}

async fn task_history(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Vec<StatusChange>> {
    Ok(Json(state.engine.status_history(id)?))
}

async fn cancel_task(State(state): State<ApiState>, Path(id): Path<TaskId>) -> ApiResult<Task> {
    Ok(Json(state.engine.cancel(id).await?))
}

async fn kill_task(State(state): State<ApiState>, Path(id): Path<TaskId>) -> ApiResult<Task> {
    Ok(Json(state.engine.kill(id).await?))
}

async fn archive_task(State(state): State<ApiState>, Path(id): Path<TaskId>) -> ApiResult<Task> {
    Ok(Json(state.engine.archive(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PriorityBody {
    pub priority: Priority,
}

async fn reprioritize_task(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
    Json(body): Json<PriorityBody>,
) -> ApiResult<Task> {
    Ok(Json(state.engine.reprioritize(id, body.priority).await?))
}

async fn pause_runner(State(state): State<ApiState>) -> ApiResult<Task> {
    Ok(Json(state.engine.pause().await?))
}

async fn resume_runner(State(state): State<ApiState>) -> ApiResult<Task> {
    Ok(Json(state.engine.resume().await?))
}

async fn clear_rate_limit(State(state): State<ApiState>) -> ApiResult<Task> {
    Ok(Json(state.engine.clear_rate_limit().await?))
}

/// Build the router with all routes.
pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/state", get(api_state))
        .route("/api/events", get(api_events))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/tasks/{id}/logs", get(task_logs))
        .route("/api/tasks/{id}/history", get(task_history))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/kill", post(kill_task))
        .route("/api/tasks/{id}/archive", post(archive_task))
        .route("/api/tasks/{id}/priority", post(reprioritize_task))
        .route("/api/runner/pause", post(pause_runner))
        .route("/api/runner/resume", post(resume_runner))
        .route("/api/runner/clear-rate-limit", post(clear_rate_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
