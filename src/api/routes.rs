//! HTTP route handlers for the control plane.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;

use super::types::{
    ErrorRateResponse, ErrorResponse, HealthResponse, JobResponse, JobsQuery, LogsQuery, Paginated,
};
use crate::engine::Engine;
use crate::registry::Task;
use crate::store::{DailyActivity, LogFilter, StoreError, TaskCount};
use crate::types::{JobCreate, JobId, JobUpdate, LogRecord, SchedulerError};

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 500;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map engine errors onto HTTP statuses and stable error codes.
fn into_api_error(e: SchedulerError) -> ApiError {
    let (status, code) = match &e {
        SchedulerError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND"),
        SchedulerError::InvalidSchedule(_) => (StatusCode::BAD_REQUEST, "INVALID_SCHEDULE"),
        SchedulerError::InvalidCron(_) => (StatusCode::BAD_REQUEST, "INVALID_CRON"),
        SchedulerError::InvalidJob(_) => (StatusCode::BAD_REQUEST, "INVALID_JOB"),
        SchedulerError::TaskTimeout(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TASK_TIMEOUT"),
        SchedulerError::TaskFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TASK_FAILURE"),
        SchedulerError::Store(StoreError::JobNotFound(_)) => {
            (StatusCode::NOT_FOUND, "JOB_NOT_FOUND")
        }
        SchedulerError::Store(StoreError::LogNotFound(_)) => {
            (StatusCode::NOT_FOUND, "LOG_NOT_FOUND")
        }
        SchedulerError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_FAILURE"),
        SchedulerError::EngineStopped => (StatusCode::SERVICE_UNAVAILABLE, "ENGINE_STOPPED"),
        SchedulerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
}

fn not_found(what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("{what} not found"),
            code: "NOT_FOUND".to_string(),
        }),
    )
}

fn page(limit: Option<u32>, offset: Option<u32>) -> (u32, u32) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    (limit, offset.unwrap_or(0))
}

pub async fn health(State(engine): State<Arc<Engine>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if engine.is_running() {
            "healthy"
        } else {
            "unhealthy"
        },
    })
}

// ── Tasks ─────────────────────────────────────────────────────────────

pub async fn list_tasks(State(engine): State<Arc<Engine>>) -> Json<Vec<Task>> {
    Json(engine.list_tasks())
}

pub async fn get_task(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> Result<Json<Task>, ApiError> {
    engine.get_task(&name).map(Json).map_err(into_api_error)
}

pub async fn run_task(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
    Json(params): Json<crate::types::TaskParams>,
) -> Result<Json<LogRecord>, ApiError> {
    engine
        .run_task(&name, params)
        .await
        .map(Json)
        .map_err(into_api_error)
}

// ── Jobs ──────────────────────────────────────────────────────────────

pub async fn list_jobs(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let (limit, offset) = page(query.limit, query.offset);
    let jobs = engine
        .list_jobs(query.task.as_deref(), limit, offset)
        .await
        .map_err(into_api_error)?;
    let responses = jobs
        .into_iter()
        .map(|job| JobResponse::from_job(job, engine.registry()))
        .collect();
    Ok(Json(responses))
}

pub async fn get_job(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = engine
        .get_job(&JobId::new(id))
        .await
        .map_err(into_api_error)?
        .ok_or_else(|| not_found("job"))?;
    Ok(Json(JobResponse::from_job(job, engine.registry())))
}

pub async fn create_job(
    State(engine): State<Arc<Engine>>,
    Json(spec): Json<JobCreate>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job = engine.create_job(spec).await.map_err(into_api_error)?;
    Ok((
        StatusCode::CREATED,
        Json(JobResponse::from_job(job, engine.registry())),
    ))
}

pub async fn update_job(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(patch): Json<JobUpdate>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = engine
        .update_job(&JobId::new(id), patch)
        .await
        .map_err(into_api_error)?;
    Ok(Json(JobResponse::from_job(job, engine.registry())))
}

pub async fn delete_job(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = engine
        .delete_job(&JobId::new(id))
        .await
        .map_err(into_api_error)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("job"))
    }
}

// ── Logs ──────────────────────────────────────────────────────────────

pub async fn list_logs(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Paginated<LogRecord>>, ApiError> {
    let (limit, offset) = page(query.limit, query.offset);
    let filter = LogFilter {
        job_id: query.job_id.map(JobId::new),
        status: query.status,
    };
    let (items, total) = engine
        .list_logs(&filter, limit, offset)
        .await
        .map_err(into_api_error)?;
    Ok(Json(Paginated {
        items,
        total,
        offset,
        limit,
    }))
}

// ── Analytics ─────────────────────────────────────────────────────────

pub async fn recent_activity(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    engine
        .recent_activity(DEFAULT_PAGE_SIZE)
        .await
        .map(Json)
        .map_err(into_api_error)
}

pub async fn upcoming_executions(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let jobs = engine
        .upcoming_executions(DEFAULT_PAGE_SIZE)
        .await
        .map_err(into_api_error)?;
    let responses = jobs
        .into_iter()
        .map(|job| JobResponse::from_job(job, engine.registry()))
        .collect();
    Ok(Json(responses))
}

pub async fn execution_history(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<DailyActivity>>, ApiError> {
    engine
        .execution_history(7)
        .await
        .map(Json)
        .map_err(into_api_error)
}

pub async fn task_distribution(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<TaskCount>>, ApiError> {
    engine
        .task_distribution()
        .await
        .map(Json)
        .map_err(into_api_error)
}

pub async fn error_rate(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<ErrorRateResponse>, ApiError> {
    let (total, failed, error_rate) = engine.error_rate().await.map_err(into_api_error)?;
    Ok(Json(ErrorRateResponse {
        total,
        failed,
        error_rate,
    }))
}
