//! Engine lifecycle: store bootstrap, default-job reconciliation, the
//! dispatcher beat, and shutdown.
//!
//! The dispatcher never executes tasks itself; it only keeps one live
//! [`JobRunner`] per active job and reaps finished ones. All long-lived
//! tasks observe a single watch channel for shutdown.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api;
use crate::config::Settings;
use crate::executor::Executor;
use crate::registry::{Task, TaskRegistry};
use crate::runner::{JobLocks, JobRunner};
use crate::store::{DailyActivity, LogFilter, SqliteStore, Store, TaskCount};
use crate::types::{
    Job, JobCreate, JobId, JobUpdate, LogRecord, SchedulerError, TaskParams,
};

/// Cadence of the dispatcher beat.
const BEAT_INTERVAL: Duration = Duration::from_secs(1);

struct RunnerHandle {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// The scheduling engine: owns the store, the registry, the dispatcher,
/// and one runner per active job.
pub struct Engine {
    settings: Settings,
    registry: Arc<TaskRegistry>,
    defaults: Vec<JobCreate>,
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    running: RwLock<bool>,
    stop_tx: watch::Sender<bool>,
    runners: Arc<DashMap<JobId, RunnerHandle>>,
    locks: JobLocks,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    api_server: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open the store and assemble an engine. The scheduler does not run
    /// until [`Engine::start`] is called.
    pub fn new(
        settings: Settings,
        registry: TaskRegistry,
        defaults: Vec<JobCreate>,
    ) -> Result<Self, SchedulerError> {
        let store = Arc::new(SqliteStore::open(&settings.db_uri)?);
        Ok(Self::with_store(settings, registry, defaults, store))
    }

    /// Assemble an engine over an already-open store.
    pub fn with_store(
        settings: Settings,
        registry: TaskRegistry,
        defaults: Vec<JobCreate>,
        store: Arc<dyn Store>,
    ) -> Self {
        let registry = Arc::new(registry);
        let (stop_tx, stop_rx) = watch::channel(false);
        let executor = Arc::new(Executor::new(store.clone(), registry.clone(), stop_rx));
        Self {
            settings,
            registry,
            defaults,
            store,
            executor,
            running: RwLock::new(false),
            stop_tx,
            runners: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
            dispatcher: Mutex::new(None),
            api_server: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    pub fn stop_subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Start the engine: recovery sweep, optional API server, default-job
    /// reconciliation, then the dispatcher. Idempotent while running.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if self.is_running() {
            return Ok(());
        }

        let swept = self.store.recover_interrupted_logs().await?;
        if swept > 0 {
            tracing::warn!("reconciled {swept} interrupted execution(s) from a previous run");
        }

        let _ = self.stop_tx.send(false);

        if self.settings.api_on {
            let handle = api::serve(self.clone()).await?;
            *self.api_server.lock() = Some(handle);
        }

        self.reconcile_defaults().await?;

        *self.running.write() = true;

        let engine = self.clone();
        *self.dispatcher.lock() = Some(tokio::spawn(async move { engine.dispatch_loop().await }));
        tracing::info!("scheduler started");
        Ok(())
    }

    /// Stop the engine: signal every runner and the dispatcher, then await
    /// them. In-flight invocations are cancelled and their logs finalised
    /// as FAILED with error "cancelled".
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        *self.running.write() = false;
        let _ = self.stop_tx.send(true);

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                tracing::error!("dispatcher task failed: {e}");
            }
        }

        let ids: Vec<JobId> = self.runners.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, runner)) = self.runners.remove(&id) {
                let _ = runner.stop.send(true);
                if let Err(e) = runner.handle.await {
                    tracing::error!("runner for job {id} failed: {e}");
                }
            }
        }

        let api_server = self.api_server.lock().take();
        if let Some(handle) = api_server {
            if let Err(e) = handle.await {
                tracing::error!("API server task failed: {e}");
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Start, wait for SIGINT/SIGTERM, then stop.
    pub async fn run(self: &Arc<Self>) -> Result<(), SchedulerError> {
        self.start().await?;
        shutdown_signal().await;
        tracing::info!("shutdown initiated");
        self.stop().await;
        Ok(())
    }

    // ── Reconciler ────────────────────────────────────────────────────

    /// Materialise the configured default jobs by deterministic hash id.
    async fn reconcile_defaults(&self) -> Result<(), SchedulerError> {
        if self.defaults.is_empty() {
            return Ok(());
        }
        tracing::info!("reconciling {} default job(s)", self.defaults.len());
        for spec in &self.defaults {
            let spec = spec.validated()?;
            if !self.registry.contains(&spec.task) {
                return Err(SchedulerError::TaskNotFound(spec.task.clone()));
            }
            let job = self.store.upsert_default_job(&spec).await?;
            tracing::debug!("default job {} ({})", job.id, job.display_name());
        }
        Ok(())
    }

    // ── Dispatcher ────────────────────────────────────────────────────

    async fn dispatch_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(BEAT_INTERVAL);
        let mut stop = self.stop_tx.subscribe();
        loop {
            let ticked = tokio::select! {
                _ = ticker.tick() => true,
                _ = stop.wait_for(|stopped| *stopped) => false,
            };
            if !ticked {
                break;
            }
            if !self.is_running() {
                break;
            }
            self.beat().await;
        }
        tracing::debug!("dispatcher terminated");
    }

    /// One beat: reap finished runners, then ensure every active job has
    /// a live one.
    async fn beat(&self) {
        self.runners.retain(|id, runner| {
            if runner.handle.is_finished() {
                tracing::debug!("reaping finished runner for job {id}");
                false
            } else {
                true
            }
        });

        let jobs = match self.store.list_active_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("beat: failed to list active jobs: {e}");
                return;
            }
        };
        for job in jobs {
            if !self.runners.contains_key(&job.id) {
                self.spawn_runner(job.id);
            }
        }
    }

    fn spawn_runner(&self, job_id: JobId) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = JobRunner::new(
            job_id.clone(),
            self.store.clone(),
            self.executor.clone(),
            self.locks.clone(),
            self.stop_tx.subscribe(),
            stop_rx,
        );
        let handle = tokio::spawn(runner.run());
        self.runners.insert(
            job_id,
            RunnerHandle {
                handle,
                stop: stop_tx,
            },
        );
    }

    /// Signal a job's runner to wind down (after an update or delete). The
    /// dispatcher respawns one on its next beat if the job is still
    /// active; until the old runner drains, the per-job lock prevents
    /// overlapping executions.
    fn retire_runner(&self, job_id: &JobId) {
        if let Some((_, runner)) = self.runners.remove(job_id) {
            let _ = runner.stop.send(true);
        }
    }

    // ── Control-plane operations ──────────────────────────────────────

    pub fn list_tasks(&self) -> Vec<Task> {
        self.registry.list()
    }

    pub fn get_task(&self, name: &str) -> Result<Task, SchedulerError> {
        self.registry.lookup(name).map(|task| task.meta.clone())
    }

    /// Execute a task once, ad hoc, bypassing the scheduler.
    pub async fn run_task(
        &self,
        name: &str,
        params: TaskParams,
    ) -> Result<LogRecord, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::EngineStopped);
        }
        self.executor.run_task(name, params).await
    }

    pub async fn create_job(&self, spec: JobCreate) -> Result<Job, SchedulerError> {
        let spec = spec.validated()?;
        if !self.registry.contains(&spec.task) {
            return Err(SchedulerError::InvalidJob(format!(
                "task '{}' is not registered",
                spec.task
            )));
        }
        let job = self.store.create_job(&spec).await?;
        tracing::info!("created job {} ({})", job.id, job.display_name());
        Ok(job)
    }

    pub async fn update_job(&self, id: &JobId, patch: JobUpdate) -> Result<Job, SchedulerError> {
        let patch = JobUpdate {
            params: patch.params,
            options: match patch.options {
                Some(options) => {
                    options.validate()?;
                    Some(options)
                }
                None => None,
            },
            schedule: patch.schedule.map(|s| s.validated()).transpose()?,
        };
        let mut job = self.store.update_job(id, &patch).await?;
        // The stored fire time may belong to the old schedule; recompute
        // against the new one before the respawned runner takes over.
        let next = crate::schedule::next_run(&job.schedule, chrono::Utc::now(), job.last_run).ok();
        self.store.set_next_run(id, next).await?;
        job.next_run = next;
        self.retire_runner(id);
        tracing::info!("updated job {} ({})", job.id, job.display_name());
        Ok(job)
    }

    pub async fn delete_job(&self, id: &JobId) -> Result<bool, SchedulerError> {
        self.retire_runner(id);
        let deleted = self.store.delete_job(id).await?;
        if deleted {
            tracing::info!("deleted job {id}");
        }
        Ok(deleted)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, SchedulerError> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn list_jobs(
        &self,
        task: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.list_jobs(task, limit, offset).await?)
    }

    pub async fn list_logs(
        &self,
        filter: &LogFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<LogRecord>, u64), SchedulerError> {
        Ok(self.store.list_logs(filter, limit, offset).await?)
    }

    // ── Analytics derivations ─────────────────────────────────────────

    pub async fn recent_activity(&self, limit: u32) -> Result<Vec<LogRecord>, SchedulerError> {
        let since = chrono::Utc::now() - chrono::Duration::hours(24);
        Ok(self.store.logs_since(since, limit).await?)
    }

    pub async fn upcoming_executions(&self, limit: u32) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.upcoming_jobs(limit).await?)
    }

    pub async fn execution_history(&self, days: u32) -> Result<Vec<DailyActivity>, SchedulerError> {
        Ok(self.store.daily_activity(days).await?)
    }

    pub async fn task_distribution(&self) -> Result<Vec<TaskCount>, SchedulerError> {
        Ok(self.store.task_distribution().await?)
    }

    /// `(total, failed, rate)` over the trailing 24 hours.
    pub async fn error_rate(&self) -> Result<(u64, u64, f64), SchedulerError> {
        let since = chrono::Utc::now() - chrono::Duration::hours(24);
        let (total, failed) = self.store.status_counts_since(since).await?;
        let rate = if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        };
        Ok((total, failed, rate))
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobOptions, Schedule, TimeUnit};

    fn test_settings() -> Settings {
        Settings {
            api_on: false,
            db_uri: "sqlite://:memory:".to_string(),
            ..Default::default()
        }
    }

    fn noop_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .register("noop", "No-op", None, |_| async {
                Ok(serde_json::Value::Null)
            })
            .unwrap();
        registry
    }

    fn noop_default() -> JobCreate {
        JobCreate {
            task: "noop".to_string(),
            params: TaskParams::new(),
            options: JobOptions::default(),
            schedule: Schedule::Interval {
                interval: 1,
                unit: TimeUnit::Hours,
                at: None,
            },
        }
    }

    #[tokio::test]
    async fn start_stop_toggles_running() {
        let engine = Arc::new(Engine::new(test_settings(), noop_registry(), vec![]).unwrap());
        assert!(!engine.is_running());

        engine.start().await.unwrap();
        assert!(engine.is_running());
        // Second start is a no-op.
        engine.start().await.unwrap();

        engine.stop().await;
        assert!(!engine.is_running());
        // Second stop is a no-op too.
        engine.stop().await;
    }

    #[tokio::test]
    async fn reconciler_is_idempotent_across_restarts() {
        let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::open_in_memory().unwrap());

        let mut other = noop_default();
        other
            .params
            .insert("variant".to_string(), serde_json::json!("b"));
        let defaults = vec![noop_default(), other];

        let mut ids = Vec::new();
        for _ in 0..5 {
            let engine = Arc::new(Engine::with_store(
                test_settings(),
                noop_registry(),
                defaults.clone(),
                store.clone(),
            ));
            engine.start().await.unwrap();
            engine.stop().await;

            let jobs = store.list_jobs(None, 100, 0).await.unwrap();
            let mut current: Vec<String> =
                jobs.iter().map(|j| j.id.as_str().to_string()).collect();
            current.sort();
            assert_eq!(current.len(), 2);
            ids.push(current);
        }
        // Identifiers never change across restarts.
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn default_with_unknown_task_fails_startup() {
        let mut bad = noop_default();
        bad.task = "ghost".to_string();
        let engine = Arc::new(Engine::new(test_settings(), noop_registry(), vec![bad]).unwrap());
        assert!(matches!(
            engine.start().await,
            Err(SchedulerError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_job_validates_task_and_schedule() {
        let engine = Arc::new(Engine::new(test_settings(), noop_registry(), vec![]).unwrap());
        engine.start().await.unwrap();

        let mut unknown = noop_default();
        unknown.task = "ghost".to_string();
        assert!(matches!(
            engine.create_job(unknown).await,
            Err(SchedulerError::InvalidJob(_))
        ));

        let mut bad_schedule = noop_default();
        bad_schedule.schedule = Schedule::Cron("not cron".to_string());
        assert!(matches!(
            engine.create_job(bad_schedule).await,
            Err(SchedulerError::InvalidCron(_))
        ));

        let job = engine.create_job(noop_default()).await.unwrap();
        assert_eq!(job.task_name, "noop");

        engine.stop().await;
    }

    #[tokio::test]
    async fn dispatcher_picks_up_created_job() {
        let engine = Arc::new(Engine::new(test_settings(), noop_registry(), vec![]).unwrap());
        engine.start().await.unwrap();

        let job = engine.create_job(noop_default()).await.unwrap();

        // Picked up within two beats (plus scheduling slack).
        let mut appeared = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if engine.runners.contains_key(&job.id) {
                appeared = true;
                break;
            }
        }
        assert!(appeared, "runner spawned for new job");

        engine.stop().await;
        assert!(engine.runners.is_empty());
    }

    #[tokio::test]
    async fn ad_hoc_run_requires_running_engine() {
        let engine = Arc::new(Engine::new(test_settings(), noop_registry(), vec![]).unwrap());
        assert!(matches!(
            engine.run_task("noop", TaskParams::new()).await,
            Err(SchedulerError::EngineStopped)
        ));

        engine.start().await.unwrap();
        let log = engine.run_task("noop", TaskParams::new()).await.unwrap();
        assert_eq!(log.job_id, None);
        engine.stop().await;
    }

    #[tokio::test]
    async fn update_recomputes_next_run_and_restarts_runner() {
        let engine = Arc::new(Engine::new(test_settings(), noop_registry(), vec![]).unwrap());
        engine.start().await.unwrap();
        let job = engine.create_job(noop_default()).await.unwrap();

        // Wait for the first execution to stamp next_run.
        let mut stamped = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(job) = engine.get_job(&job.id).await.unwrap() {
                if job.next_run.is_some() {
                    stamped = true;
                    break;
                }
            }
        }
        assert!(stamped, "first execution sets next_run");

        let patch = JobUpdate {
            schedule: Some(Schedule::Cron("0 3 * * *".to_string())),
            ..Default::default()
        };
        let updated = engine.update_job(&job.id, patch).await.unwrap();
        assert_eq!(updated.schedule, Schedule::Cron("0 3 * * *".to_string()));

        engine.stop().await;
    }

    #[tokio::test]
    async fn delete_job_detaches_runner() {
        let engine = Arc::new(Engine::new(test_settings(), noop_registry(), vec![]).unwrap());
        engine.start().await.unwrap();
        let job = engine.create_job(noop_default()).await.unwrap();

        assert!(engine.delete_job(&job.id).await.unwrap());
        assert!(!engine.delete_job(&job.id).await.unwrap());
        assert!(engine.get_job(&job.id).await.unwrap().is_none());

        engine.stop().await;
    }
}
