//! Per-job runner: one long-lived worker per active job that computes the
//! next fire time, waits, executes, and reschedules.
//!
//! Runners are crash-resistant: any store or schedule error is logged and
//! followed by a 60 second pause rather than a panic. Shutdown and job
//! updates reach the runner through watch channels observed at every
//! suspension point.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;

use crate::executor::Executor;
use crate::schedule::next_run;
use crate::store::Store;
use crate::types::{Job, JobId, SchedulerError};

/// Pause after an unexpected error before the next pass.
const ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Map of per-job overlap locks, shared with the engine.
pub type JobLocks = Arc<DashMap<JobId, Arc<tokio::sync::Mutex<()>>>>;

/// What the runner does after one pass.
enum Pass {
    Sleep(Duration),
    Exit,
}

pub struct JobRunner {
    job_id: JobId,
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    locks: JobLocks,
    /// Engine-wide shutdown signal.
    engine_stop: watch::Receiver<bool>,
    /// Per-runner signal, flipped when the job is updated or deleted.
    job_stop: watch::Receiver<bool>,
}

impl JobRunner {
    pub fn new(
        job_id: JobId,
        store: Arc<dyn Store>,
        executor: Arc<Executor>,
        locks: JobLocks,
        engine_stop: watch::Receiver<bool>,
        job_stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job_id,
            store,
            executor,
            locks,
            engine_stop,
            job_stop,
        }
    }

    /// Drive the job until shutdown, job removal, or its end date.
    pub async fn run(mut self) {
        tracing::debug!("runner for job {} started", self.job_id);
        loop {
            if *self.engine_stop.borrow() || *self.job_stop.borrow() {
                break;
            }
            let pass = match self.pass().await {
                Ok(pass) => pass,
                Err(e) => {
                    tracing::error!("runner for job {}: {}", self.job_id, e);
                    Pass::Sleep(ERROR_BACKOFF)
                }
            };
            match pass {
                Pass::Exit => break,
                Pass::Sleep(duration) => {
                    let mut engine_stop = self.engine_stop.clone();
                    let mut job_stop = self.job_stop.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = engine_stop.wait_for(|stop| *stop) => break,
                        _ = job_stop.wait_for(|stop| *stop) => break,
                    }
                }
            }
        }
        self.locks.remove(&self.job_id);
        tracing::debug!("runner for job {} terminated", self.job_id);
    }

    async fn pass(&self) -> Result<Pass, SchedulerError> {
        let Some(job) = self.store.get_job(&self.job_id).await? else {
            return Ok(Pass::Exit);
        };

        let now = Utc::now();
        if let Some(end) = job.options.end_date {
            if end <= now {
                // Past its end date: clear the stale fire time and retire.
                if job.next_run.is_some() {
                    self.store.set_next_run(&self.job_id, None).await?;
                }
                return Ok(Pass::Exit);
            }
        }

        if self.can_run(&job, now).await? {
            let lock = self
                .locks
                .entry(self.job_id.clone())
                .or_default()
                .clone();
            match lock.try_lock() {
                Ok(_guard) => {
                    self.executor.execute(&job).await?;
                    return self.reschedule(&job).await;
                }
                Err(_) => {
                    // A previous execution is still in flight; skip this
                    // fire rather than queueing it.
                    tracing::debug!("job {} still running, skipping this fire", self.job_id);
                }
            };
        }

        Ok(self.sleep_until(job.next_run))
    }

    /// Eligibility per stored state: date window, no RUNNING log, and the
    /// stored `next_run` (a null `next_run` means "first run" only when no
    /// log exists yet).
    async fn can_run(&self, job: &Job, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        if let Some(start) = job.options.start_date {
            if now < start {
                return Ok(false);
            }
        }
        if let Some(end) = job.options.end_date {
            if now >= end {
                return Ok(false);
            }
        }
        if self.store.has_running_log(&job.id).await? {
            return Ok(false);
        }
        match job.next_run {
            Some(next) => Ok(next <= now),
            None => Ok(self.store.last_log(&job.id).await?.is_none()),
        }
    }

    /// After an execution, persist the next fire time and plan the wait.
    async fn reschedule(&self, job: &Job) -> Result<Pass, SchedulerError> {
        let now = Utc::now();
        if let Some(end) = job.options.end_date {
            if end <= now {
                self.store.set_next_run(&self.job_id, None).await?;
                return Ok(Pass::Exit);
            }
        }
        match next_run(&job.schedule, now, None) {
            Ok(next) => {
                self.store.set_next_run(&self.job_id, Some(next)).await?;
                Ok(self.sleep_until(Some(next)))
            }
            Err(e) => {
                tracing::warn!("job {}: cannot determine next run: {}", self.job_id, e);
                Ok(Pass::Sleep(ERROR_BACKOFF))
            }
        }
    }

    fn sleep_until(&self, next: Option<DateTime<Utc>>) -> Pass {
        match next {
            Some(next) => {
                let wait = (next - Utc::now()).num_milliseconds().max(0) as u64;
                if wait == 0 {
                    // Due but not runnable (e.g. overlap): re-check after a
                    // beat instead of spinning.
                    Pass::Sleep(Duration::from_secs(1))
                } else {
                    Pass::Sleep(Duration::from_millis(wait))
                }
            }
            None => Pass::Sleep(ERROR_BACKOFF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskRegistry;
    use crate::store::SqliteStore;
    use crate::types::{JobCreate, JobOptions, Schedule, TaskParams, TimeUnit};

    struct Fixture {
        store: Arc<SqliteStore>,
        executor: Arc<Executor>,
        locks: JobLocks,
        engine_stop: watch::Sender<bool>,
    }

    fn fixture(registry: TaskRegistry) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (engine_stop, stop_rx) = watch::channel(false);
        let executor = Arc::new(Executor::new(store.clone(), Arc::new(registry), stop_rx));
        Fixture {
            store,
            executor,
            locks: Arc::new(DashMap::new()),
            engine_stop,
        }
    }

    fn runner(fx: &Fixture, job_id: JobId) -> (JobRunner, watch::Sender<bool>) {
        let (job_stop_tx, job_stop_rx) = watch::channel(false);
        let runner = JobRunner::new(
            job_id,
            fx.store.clone(),
            fx.executor.clone(),
            fx.locks.clone(),
            fx.engine_stop.subscribe(),
            job_stop_rx,
        );
        (runner, job_stop_tx)
    }

    fn counter_registry() -> (TaskRegistry, Arc<std::sync::atomic::AtomicU32>) {
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let count_in_task = count.clone();
        let mut registry = TaskRegistry::new();
        registry
            .register("count", "Count", None, move |_| {
                let count = count_in_task.clone();
                async move {
                    count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }
            })
            .unwrap();
        (registry, count)
    }

    async fn seconds_job(store: &SqliteStore, interval: u32) -> Job {
        let spec = JobCreate {
            task: "count".to_string(),
            params: TaskParams::new(),
            options: JobOptions::default(),
            schedule: Schedule::Interval {
                interval,
                unit: TimeUnit::Seconds,
                at: None,
            },
        };
        store.create_job(&spec).await.unwrap()
    }

    #[tokio::test]
    async fn first_pass_runs_and_reschedules() {
        let (registry, count) = counter_registry();
        let fx = fixture(registry);
        let job = seconds_job(&fx.store, 3600).await;

        let (runner, _stop) = runner(&fx, job.id.clone());
        let handle = tokio::spawn(runner.run());

        // First pass executes immediately (no next_run, no history) and
        // then the runner sleeps toward the next fire an hour out.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);

        let stored = fx.store.get_job(&job.id).await.unwrap().unwrap();
        assert!(stored.last_run.is_some());
        let next = stored.next_run.unwrap();
        assert!(next > Utc::now());
        assert!(next >= stored.last_run.unwrap());

        fx.engine_stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn job_stop_signal_terminates_runner() {
        let (registry, _count) = counter_registry();
        let fx = fixture(registry);
        let job = seconds_job(&fx.store, 3600).await;

        let (runner, job_stop) = runner(&fx, job.id.clone());
        let handle = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(200)).await;

        job_stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("runner exits on job stop signal")
            .unwrap();
        // Its overlap lock is gone with it.
        assert!(fx.locks.get(&job.id).is_none());
    }

    #[tokio::test]
    async fn deleted_job_terminates_runner() {
        let (registry, _count) = counter_registry();
        let fx = fixture(registry);
        let job = seconds_job(&fx.store, 1).await;
        fx.store.delete_job(&job.id).await.unwrap();

        let (runner, _stop) = runner(&fx, job.id.clone());
        tokio::time::timeout(Duration::from_secs(2), runner.run())
            .await
            .expect("runner exits when job row is gone");
    }

    #[tokio::test]
    async fn expired_job_clears_next_run_and_exits() {
        let (registry, count) = counter_registry();
        let fx = fixture(registry);

        let spec = JobCreate {
            task: "count".to_string(),
            params: TaskParams::new(),
            options: JobOptions {
                start_date: Some(Utc::now() - chrono::Duration::days(2)),
                end_date: Some(Utc::now() - chrono::Duration::days(1)),
                ..Default::default()
            },
            schedule: Schedule::Interval {
                interval: 1,
                unit: TimeUnit::Seconds,
                at: None,
            },
        };
        let job = fx.store.create_job(&spec).await.unwrap();
        fx.store
            .set_next_run(&job.id, Some(Utc::now() - chrono::Duration::hours(1)))
            .await
            .unwrap();

        let (runner, _stop) = runner(&fx, job.id.clone());
        tokio::time::timeout(Duration::from_secs(2), runner.run())
            .await
            .expect("runner exits past end_date");

        let stored = fx.store.get_job(&job.id).await.unwrap().unwrap();
        assert!(stored.next_run.is_none());
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn future_start_date_defers_execution() {
        let (registry, count) = counter_registry();
        let fx = fixture(registry);

        let spec = JobCreate {
            task: "count".to_string(),
            params: TaskParams::new(),
            options: JobOptions {
                start_date: Some(Utc::now() + chrono::Duration::days(1)),
                ..Default::default()
            },
            schedule: Schedule::Interval {
                interval: 1,
                unit: TimeUnit::Seconds,
                at: None,
            },
        };
        let job = fx.store.create_job(&spec).await.unwrap();

        let (runner, _stop) = runner(&fx, job.id.clone());
        let handle = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);

        fx.engine_stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn running_log_blocks_eligibility() {
        let (registry, _count) = counter_registry();
        let fx = fixture(registry);
        let job = seconds_job(&fx.store, 1).await;

        // Simulate an in-flight execution surviving from another worker.
        fx.store
            .create_log(Some(&job.id), crate::types::LogStatus::Running, Utc::now())
            .await
            .unwrap();

        let (runner, _stop) = runner(&fx, job.id.clone());
        let job_row = fx.store.get_job(&job.id).await.unwrap().unwrap();
        assert!(!runner.can_run(&job_row, Utc::now()).await.unwrap());
    }
}
