//! Request and response shapes for the HTTP control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::{Task, TaskRegistry};
use crate::types::{Job, JobId, JobOptions, Schedule, TaskParams};

/// Error payload returned by every failing endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Paginated collection wrapper.
#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// A job as rendered to API clients, with the task catalog entry inlined.
#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    pub id: JobId,
    pub name: String,
    pub task: Task,
    pub params: TaskParams,
    pub options: JobOptions,
    pub schedule: Schedule,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobResponse {
    pub fn from_job(job: Job, registry: &TaskRegistry) -> Self {
        let task = registry
            .get(&job.task_name)
            .map(|t| t.meta.clone())
            .unwrap_or_else(|| Task {
                name: job.task_name.clone(),
                title: job.task_name.clone(),
                description: None,
            });
        let name = job.display_name();
        Self {
            id: job.id,
            name,
            task,
            params: job.params,
            options: job.options,
            schedule: job.schedule,
            last_run: job.last_run,
            next_run: job.next_run,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Query string for `GET /api/jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobsQuery {
    pub task: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Query string for `GET /api/logs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsQuery {
    pub job_id: Option<String>,
    pub status: Option<crate::types::LogStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Payload of `GET /api/analytics/error-rate`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRateResponse {
    pub total: u64,
    pub failed: u64,
    pub error_rate: f64,
}
