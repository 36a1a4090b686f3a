//! Execution log records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobId;

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStatus::Pending => write!(f, "pending"),
            LogStatus::Running => write!(f, "running"),
            LogStatus::Completed => write!(f, "completed"),
            LogStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LogStatus::Pending),
            "running" => Ok(LogStatus::Running),
            "completed" => Ok(LogStatus::Completed),
            "failed" => Ok(LogStatus::Failed),
            other => Err(format!("unknown log status: {other}")),
        }
    }
}

/// Record of a single job execution (covering all its retry rounds).
///
/// `job_id` is `None` for ad-hoc runs triggered through the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub job_id: Option<JobId>,
    pub status: LogStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock seconds from `started_at` to `completed_at`.
    pub duration: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Retries actually performed (0 = succeeded or gave up on first try).
    pub retries: u32,
    pub created_at: DateTime<Utc>,
}
