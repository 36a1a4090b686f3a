//! Job execution: one invocation with timeout, retry with exponential
//! backoff, and durable log materialisation.
//!
//! Task-level failures never escape [`Executor::execute`]; they become
//! FAILED logs. Store failures do escape so the caller can log them and
//! reconverge on its next pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;

use crate::registry::TaskRegistry;
use crate::store::Store;
use crate::types::{Job, LogRecord, LogStatus, SchedulerError, TaskParams};

/// Upper bound on the backoff delay between attempts, in seconds.
const MAX_BACKOFF_SECS: f64 = 300.0;

/// Error recorded when an attempt exceeds the job's timeout.
const TIMEOUT_ERROR: &str = "Job execution timed out";

/// Error recorded when engine shutdown cancels an in-flight invocation.
const CANCELLED_ERROR: &str = "cancelled";

/// Outcome of a single invocation attempt.
enum Attempt {
    Success(serde_json::Value),
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Runs job invocations against the task registry and records logs.
pub struct Executor {
    store: Arc<dyn Store>,
    registry: Arc<TaskRegistry>,
    /// Engine-wide stop signal; flips to `true` on shutdown.
    stop: watch::Receiver<bool>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<TaskRegistry>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            registry,
            stop,
        }
    }

    /// Execute one scheduled invocation of `job`, retrying per its options.
    pub async fn execute(&self, job: &Job) -> Result<LogRecord, SchedulerError> {
        let now = Utc::now();
        self.store.set_last_run(&job.id, now).await?;
        let mut log = self
            .store
            .create_log(Some(&job.id), LogStatus::Running, now)
            .await?;

        let max_retries = job.options.max_retries.unwrap_or(0);
        let mut last_error: Option<String> = None;

        for attempt in 0..=max_retries {
            log.retries = attempt;
            match self
                .attempt(&job.task_name, &job.params, job.options.timeout)
                .await
            {
                Attempt::Success(value) => {
                    log.status = LogStatus::Completed;
                    log.result = Some(value);
                    break;
                }
                Attempt::TimedOut => {
                    tracing::warn!(
                        "job {} timed out (attempt {}/{})",
                        job.id,
                        attempt + 1,
                        max_retries + 1
                    );
                    last_error = Some(TIMEOUT_ERROR.to_string());
                }
                Attempt::Failed(message) => {
                    tracing::error!(
                        "job {} failed (attempt {}/{}): {}",
                        job.id,
                        attempt + 1,
                        max_retries + 1,
                        message
                    );
                    last_error = Some(message);
                }
                Attempt::Cancelled => {
                    last_error = Some(CANCELLED_ERROR.to_string());
                    break;
                }
            }

            if attempt < max_retries {
                if !self.backoff(attempt).await {
                    // Shutdown arrived during backoff.
                    last_error = Some(CANCELLED_ERROR.to_string());
                    break;
                }
            }
        }

        if log.status != LogStatus::Completed {
            log.status = LogStatus::Failed;
            log.error = last_error;
        }
        let completed_at = Utc::now();
        log.completed_at = Some(completed_at);
        log.duration = Some((completed_at - log.started_at).num_milliseconds() as f64 / 1000.0);
        self.store.update_log(&log).await?;
        Ok(log)
    }

    /// Execute a task once, outside the scheduler, recording a log with no
    /// job association. Lookup failures surface to the caller.
    pub async fn run_task(
        &self,
        task_name: &str,
        params: TaskParams,
    ) -> Result<LogRecord, SchedulerError> {
        self.registry.lookup(task_name)?;

        let now = Utc::now();
        let mut log = self.store.create_log(None, LogStatus::Running, now).await?;

        match self.attempt(task_name, &params, None).await {
            Attempt::Success(value) => {
                log.status = LogStatus::Completed;
                log.result = Some(value);
            }
            Attempt::Failed(message) => {
                log.status = LogStatus::Failed;
                log.error = Some(message);
            }
            Attempt::TimedOut => {
                log.status = LogStatus::Failed;
                log.error = Some(TIMEOUT_ERROR.to_string());
            }
            Attempt::Cancelled => {
                log.status = LogStatus::Failed;
                log.error = Some(CANCELLED_ERROR.to_string());
            }
        }
        let completed_at = Utc::now();
        log.completed_at = Some(completed_at);
        log.duration = Some((completed_at - log.started_at).num_milliseconds() as f64 / 1000.0);
        self.store.update_log(&log).await?;
        Ok(log)
    }

    /// One invocation attempt, bounded by the optional timeout and by
    /// engine shutdown.
    async fn attempt(
        &self,
        task_name: &str,
        params: &TaskParams,
        timeout: Option<u64>,
    ) -> Attempt {
        let handler = match self.registry.get(task_name) {
            Some(task) => task.handler.clone(),
            None => {
                return Attempt::Failed(
                    SchedulerError::TaskNotFound(task_name.to_string()).to_string(),
                )
            }
        };

        let invocation = handler(params.clone());
        let mut stop = self.stop.clone();

        let guarded = async {
            match timeout {
                Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), invocation)
                    .await
                {
                    Ok(Ok(value)) => Attempt::Success(value),
                    Ok(Err(e)) => Attempt::Failed(e.to_string()),
                    Err(_) => Attempt::TimedOut,
                },
                None => match invocation.await {
                    Ok(value) => Attempt::Success(value),
                    Err(e) => Attempt::Failed(e.to_string()),
                },
            }
        };

        tokio::select! {
            outcome = guarded => outcome,
            _ = stop.wait_for(|stopped| *stopped) => Attempt::Cancelled,
        }
    }

    /// Sleep `min(300, 2^(attempt+1) + U(0,1))` seconds. Returns false if
    /// shutdown interrupted the wait.
    async fn backoff(&self, attempt: u32) -> bool {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let delay = (2f64.powi(attempt as i32 + 1) + jitter).min(MAX_BACKOFF_SECS);
        let mut stop = self.stop.clone();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => true,
            _ = stop.wait_for(|stopped| *stopped) => false,
        }
    }
}
