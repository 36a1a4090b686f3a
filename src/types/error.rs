//! Error types for the scheduling engine.

use thiserror::Error;

use crate::store::StoreError;

/// Engine-wide error type.
///
/// Task-level failures (`TaskTimeout`, `TaskFailure`) are consumed by the
/// executor and materialised as FAILED logs; they only appear here when an
/// operation is invoked directly (e.g. an ad-hoc run through the API).
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("task timed out after {0} seconds")]
    TaskTimeout(u64),

    #[error("task failed: {0}")]
    TaskFailure(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("engine is not running")]
    EngineStopped,

    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let e = SchedulerError::TaskNotFound("ping".to_string());
        assert_eq!(e.to_string(), "task not found: ping");

        let e = SchedulerError::TaskTimeout(30);
        assert_eq!(e.to_string(), "task timed out after 30 seconds");

        let e = SchedulerError::EngineStopped;
        assert_eq!(e.to_string(), "engine is not running");
    }

    #[test]
    fn store_error_converts() {
        let e: SchedulerError = StoreError::Sqlite("locked".to_string()).into();
        assert!(matches!(e, SchedulerError::Store(_)));
    }
}
