//! Durable persistence for jobs and execution logs, backed by SQLite.
//!
//! All callers share one WAL-mode connection guarded by an async mutex;
//! reads are concurrent at the SQLite level, writes serialise at the
//! connection. Timestamps are stored as fixed-width RFC3339 UTC strings so
//! that lexicographic comparison in SQL matches chronological order.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{
    Job, JobCreate, JobId, JobUpdate, LogRecord, LogStatus, Schedule, TaskParams, TimeUnit,
};

/// Errors produced by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("log not found: {0}")]
    LogNotFound(i64),
}

/// Filter for log queries.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub job_id: Option<JobId>,
    pub status: Option<LogStatus>,
}

/// One day of execution activity, for the analytics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DailyActivity {
    pub date: String,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Log count for one task, for the analytics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCount {
    pub task: String,
    pub count: u64,
}

/// Abstract persistence layer for jobs and logs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new job with a store-chosen identifier.
    async fn create_job(&self, spec: &JobCreate) -> Result<Job, StoreError>;

    /// Create-or-update a default job keyed by the canonical
    /// `{task, params}` hash. Mutable fields (schedule, options) are
    /// replaced in place; run state and `created_at` are preserved.
    async fn upsert_default_job(&self, spec: &JobCreate) -> Result<Job, StoreError>;

    /// Apply a partial update. Switching schedule shape nulls the
    /// discarded shape's columns.
    async fn update_job(&self, id: &JobId, patch: &JobUpdate) -> Result<Job, StoreError>;

    /// Delete a job, cascading its logs. Returns false when absent.
    async fn delete_job(&self, id: &JobId) -> Result<bool, StoreError>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    async fn list_jobs(
        &self,
        task: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>, StoreError>;

    /// Jobs whose `end_date` is unset or in the future.
    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Active jobs with a known `next_run`, soonest first.
    async fn upcoming_jobs(&self, limit: u32) -> Result<Vec<Job>, StoreError>;

    async fn set_last_run(&self, id: &JobId, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn set_next_run(
        &self,
        id: &JobId,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Append a log in its initial state; returns the stored record.
    async fn create_log(
        &self,
        job_id: Option<&JobId>,
        status: LogStatus,
        started_at: DateTime<Utc>,
    ) -> Result<LogRecord, StoreError>;

    /// Persist the mutable fields of a log.
    async fn update_log(&self, log: &LogRecord) -> Result<(), StoreError>;

    /// Most recent log for a job, by `started_at`.
    async fn last_log(&self, job_id: &JobId) -> Result<Option<LogRecord>, StoreError>;

    async fn has_running_log(&self, job_id: &JobId) -> Result<bool, StoreError>;

    /// Filtered page of logs, newest first, plus the unpaged total.
    async fn list_logs(
        &self,
        filter: &LogFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<LogRecord>, u64), StoreError>;

    /// Logs started at or after `since`, newest first.
    async fn logs_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LogRecord>, StoreError>;

    /// Delete logs older than `age_days`; returns the number removed.
    async fn cleanup_old_logs(&self, age_days: u32) -> Result<u64, StoreError>;

    /// Startup sweep: logs left RUNNING by a crashed process become
    /// FAILED. Returns the number reconciled.
    async fn recover_interrupted_logs(&self) -> Result<u64, StoreError>;

    /// Per-day activity counts for the trailing `days` days.
    async fn daily_activity(&self, days: u32) -> Result<Vec<DailyActivity>, StoreError>;

    /// Log counts grouped by task name.
    async fn task_distribution(&self) -> Result<Vec<TaskCount>, StoreError>;

    /// `(total, failed)` log counts since `since`.
    async fn status_counts_since(&self, since: DateTime<Utc>) -> Result<(u64, u64), StoreError>;
}

/// Deterministic identifier for a default job: hex SHA-256 over the
/// canonical JSON of `{task, params}` with recursively sorted keys.
pub fn default_job_id(task: &str, params: &TaskParams) -> JobId {
    let canonical = serde_json::json!({
        "params": canonicalize(&serde_json::Value::Object(params.clone())),
        "task": task,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    JobId::new(hex::encode(hasher.finalize()))
}

/// Rebuild a JSON value with object keys in sorted order at every level.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            serde_json::to_value(sorted).expect("BTreeMap serializes")
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

const JOB_COLUMNS: &str = "id, task_name, params, schedule_interval, schedule_unit, schedule_at, \
     schedule_cron, timeout, max_retries, start_date, end_date, last_run, next_run, \
     created_at, updated_at";

const LOG_COLUMNS: &str =
    "id, job_id, status, started_at, completed_at, duration, result, error, retries, created_at";

/// SQLite-backed store.
pub struct SqliteStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (or create) the database addressed by `uri`.
    ///
    /// Accepts `sqlite://<path>`, a bare path, or `:memory:`.
    pub fn open(uri: &str) -> Result<Self, StoreError> {
        let path = uri.strip_prefix("sqlite://").unwrap_or(uri);
        if path == ":memory:" {
            return Self::open_in_memory();
        }
        let conn =
            rusqlite::Connection::open(path).map_err(|e| StoreError::Sqlite(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::init(conn)
    }

    /// Open an in-memory store (tests, throwaway runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hq_jobs (
                id                TEXT PRIMARY KEY,
                task_name         TEXT NOT NULL,
                params            TEXT NOT NULL,
                schedule_interval INTEGER,
                schedule_unit     TEXT,
                schedule_at       TEXT,
                schedule_cron     TEXT,
                timeout           INTEGER,
                max_retries       INTEGER,
                start_date        TEXT,
                end_date          TEXT,
                last_run          TEXT,
                next_run          TEXT,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hq_logs (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id       TEXT REFERENCES hq_jobs(id) ON DELETE CASCADE,
                status       TEXT NOT NULL,
                started_at   TEXT NOT NULL,
                completed_at TEXT,
                duration     REAL,
                result       TEXT,
                error        TEXT,
                retries      INTEGER NOT NULL DEFAULT 0,
                created_at   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_hq_jobs_next_run ON hq_jobs(next_run);
            CREATE INDEX IF NOT EXISTS idx_hq_logs_job_id ON hq_logs(job_id);
            CREATE INDEX IF NOT EXISTS idx_hq_logs_started_at ON hq_logs(started_at);
            CREATE INDEX IF NOT EXISTS idx_hq_logs_status ON hq_logs(status);",
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))
    }

    async fn insert_job(
        &self,
        id: &JobId,
        spec: &JobCreate,
        upsert: bool,
    ) -> Result<Job, StoreError> {
        let params_json = serde_json::to_string(&spec.params)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let (interval, unit, at, cron) = schedule_columns(&spec.schedule);
        let now = fmt_ts(Utc::now());

        let conflict_clause = if upsert {
            "ON CONFLICT(id) DO UPDATE SET
                task_name = excluded.task_name,
                params = excluded.params,
                schedule_interval = excluded.schedule_interval,
                schedule_unit = excluded.schedule_unit,
                schedule_at = excluded.schedule_at,
                schedule_cron = excluded.schedule_cron,
                timeout = excluded.timeout,
                max_retries = excluded.max_retries,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                updated_at = excluded.updated_at"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO hq_jobs ({JOB_COLUMNS})
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,NULL,NULL,?12,?13) {conflict_clause}"
        );

        {
            let conn = self.conn.lock().await;
            conn.execute(
                &sql,
                rusqlite::params![
                    id.as_str(),
                    spec.task,
                    params_json,
                    interval,
                    unit,
                    at,
                    cron,
                    spec.options.timeout.map(|v| v as i64),
                    spec.options.max_retries.map(|v| v as i64),
                    spec.options.start_date.map(fmt_ts),
                    spec.options.end_date.map(fmt_ts),
                    now,
                    now,
                ],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        }

        self.get_job(id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_job(&self, spec: &JobCreate) -> Result<Job, StoreError> {
        self.insert_job(&JobId::random(), spec, false).await
    }

    async fn upsert_default_job(&self, spec: &JobCreate) -> Result<Job, StoreError> {
        let id = default_job_id(&spec.task, &spec.params);
        self.insert_job(&id, spec, true).await
    }

    async fn update_job(&self, id: &JobId, patch: &JobUpdate) -> Result<Job, StoreError> {
        let current = self
            .get_job(id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;

        let params = patch.params.clone().unwrap_or(current.params);
        let options = patch.options.clone().unwrap_or(current.options);
        let schedule = patch.schedule.clone().unwrap_or(current.schedule);

        let params_json =
            serde_json::to_string(&params).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let (interval, unit, at, cron) = schedule_columns(&schedule);

        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE hq_jobs SET
                    params = ?1,
                    schedule_interval = ?2,
                    schedule_unit = ?3,
                    schedule_at = ?4,
                    schedule_cron = ?5,
                    timeout = ?6,
                    max_retries = ?7,
                    start_date = ?8,
                    end_date = ?9,
                    updated_at = ?10
                 WHERE id = ?11",
                rusqlite::params![
                    params_json,
                    interval,
                    unit,
                    at,
                    cron,
                    options.timeout.map(|v| v as i64),
                    options.max_retries.map(|v| v as i64),
                    options.start_date.map(fmt_ts),
                    options.end_date.map(fmt_ts),
                    fmt_ts(Utc::now()),
                    id.as_str(),
                ],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::JobNotFound(id.to_string()));
        }
        drop(conn);

        self.get_job(id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))
    }

    async fn delete_job(&self, id: &JobId) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM hq_jobs WHERE id = ?1",
                rusqlite::params![id.as_str()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows > 0)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {JOB_COLUMNS} FROM hq_jobs WHERE id = ?1");
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![id.as_str()], row_to_job)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(job)) => Ok(Some(job)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn list_jobs(
        &self,
        task: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match task {
            Some(task) => (
                format!(
                    "SELECT {JOB_COLUMNS} FROM hq_jobs WHERE task_name = ?1
                     ORDER BY created_at LIMIT ?2 OFFSET ?3"
                ),
                vec![
                    Box::new(task.to_string()),
                    Box::new(limit as i64),
                    Box::new(offset as i64),
                ],
            ),
            None => (
                format!("SELECT {JOB_COLUMNS} FROM hq_jobs ORDER BY created_at LIMIT ?1 OFFSET ?2"),
                vec![Box::new(limit as i64), Box::new(offset as i64)],
            ),
        };
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        collect_rows(stmt.query_map(param_refs.as_slice(), row_to_job))
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM hq_jobs
             WHERE end_date IS NULL OR end_date > ?1
             ORDER BY created_at"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        collect_rows(stmt.query_map(rusqlite::params![fmt_ts(Utc::now())], row_to_job))
    }

    async fn upcoming_jobs(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM hq_jobs
             WHERE (end_date IS NULL OR end_date > ?1) AND next_run IS NOT NULL
             ORDER BY next_run LIMIT ?2"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        collect_rows(stmt.query_map(
            rusqlite::params![fmt_ts(Utc::now()), limit as i64],
            row_to_job,
        ))
    }

    async fn set_last_run(&self, id: &JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE hq_jobs SET last_run = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![fmt_ts(at), fmt_ts(Utc::now()), id.as_str()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_next_run(
        &self,
        id: &JobId,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE hq_jobs SET next_run = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![next_run.map(fmt_ts), fmt_ts(Utc::now()), id.as_str()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn create_log(
        &self,
        job_id: Option<&JobId>,
        status: LogStatus,
        started_at: DateTime<Utc>,
    ) -> Result<LogRecord, StoreError> {
        let created_at = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO hq_logs (job_id, status, started_at, retries, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            rusqlite::params![
                job_id.map(|id| id.as_str().to_string()),
                status.to_string(),
                fmt_ts(started_at),
                fmt_ts(created_at),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let id = conn.last_insert_rowid();
        Ok(LogRecord {
            id,
            job_id: job_id.cloned(),
            status,
            started_at,
            completed_at: None,
            duration: None,
            result: None,
            error: None,
            retries: 0,
            created_at,
        })
    }

    async fn update_log(&self, log: &LogRecord) -> Result<(), StoreError> {
        let result_json = log
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE hq_logs SET
                    status = ?1, completed_at = ?2, duration = ?3,
                    result = ?4, error = ?5, retries = ?6
                 WHERE id = ?7",
                rusqlite::params![
                    log.status.to_string(),
                    log.completed_at.map(fmt_ts),
                    log.duration,
                    result_json,
                    log.error,
                    log.retries as i64,
                    log.id,
                ],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::LogNotFound(log.id));
        }
        Ok(())
    }

    async fn last_log(&self, job_id: &JobId) -> Result<Option<LogRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM hq_logs WHERE job_id = ?1
             ORDER BY started_at DESC, id DESC LIMIT 1"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![job_id.as_str()], row_to_log)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(log)) => Ok(Some(log)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn has_running_log(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM hq_logs WHERE job_id = ?1 AND status = 'running'",
                rusqlite::params![job_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(count > 0)
    }

    async fn list_logs(
        &self,
        filter: &LogFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<LogRecord>, u64), StoreError> {
        let conn = self.conn.lock().await;

        let mut clauses = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(job_id) = &filter.job_id {
            params.push(Box::new(job_id.as_str().to_string()));
            clauses.push(format!("job_id = ?{}", params.len()));
        }
        if let Some(status) = filter.status {
            params.push(Box::new(status.to_string()));
            clauses.push(format!("status = ?{}", params.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();

        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM hq_logs {where_clause}"),
                param_refs.as_slice(),
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM hq_logs {where_clause}
             ORDER BY started_at DESC, id DESC
             LIMIT {limit} OFFSET {offset}"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let logs = collect_rows(stmt.query_map(param_refs.as_slice(), row_to_log))?;
        Ok((logs, total as u64))
    }

    async fn logs_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM hq_logs WHERE started_at >= ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        collect_rows(stmt.query_map(rusqlite::params![fmt_ts(since), limit as i64], row_to_log))
    }

    async fn cleanup_old_logs(&self, age_days: u32) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(age_days as i64);
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM hq_logs WHERE created_at < ?1",
                rusqlite::params![fmt_ts(cutoff)],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows as u64)
    }

    async fn recover_interrupted_logs(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE hq_logs SET status = 'failed', error = ?1, completed_at = ?2
                 WHERE status = 'running'",
                rusqlite::params!["interrupted by restart", fmt_ts(now)],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows as u64)
    }

    async fn daily_activity(&self, days: u32) -> Result<Vec<DailyActivity>, StoreError> {
        let since = Utc::now() - Duration::days(days as i64);
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT substr(started_at, 1, 10) AS day,
                        COUNT(*),
                        SUM(status = 'completed'),
                        SUM(status = 'failed')
                 FROM hq_logs WHERE started_at >= ?1
                 GROUP BY day ORDER BY day",
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![fmt_ts(since)], |row| {
                Ok(DailyActivity {
                    date: row.get(0)?,
                    total: row.get::<_, i64>(1)? as u64,
                    completed: row.get::<_, i64>(2)? as u64,
                    failed: row.get::<_, i64>(3)? as u64,
                })
            })
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Sqlite(e.to_string()))
    }

    async fn task_distribution(&self) -> Result<Vec<TaskCount>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT j.task_name, COUNT(*)
                 FROM hq_logs l JOIN hq_jobs j ON l.job_id = j.id
                 GROUP BY j.task_name ORDER BY COUNT(*) DESC",
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TaskCount {
                    task: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Sqlite(e.to_string()))
    }

    async fn status_counts_since(&self, since: DateTime<Utc>) -> Result<(u64, u64), StoreError> {
        let conn = self.conn.lock().await;
        let (total, failed): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(status = 'failed'), 0)
                 FROM hq_logs WHERE started_at >= ?1",
                rusqlite::params![fmt_ts(since)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok((total as u64, failed as u64))
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

/// Fixed-width RFC3339 so SQL string comparison matches time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn schedule_columns(
    schedule: &Schedule,
) -> (
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<String>,
) {
    match schedule {
        Schedule::Interval { interval, unit, at } => (
            Some(*interval as i64),
            Some(unit.to_string()),
            at.clone(),
            None,
        ),
        Schedule::Cron(expr) => (None, None, None, Some(expr.clone())),
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Job, StoreError>> {
    let id: String = row.get(0)?;
    let task_name: String = row.get(1)?;
    let params_json: String = row.get(2)?;
    let interval: Option<i64> = row.get(3)?;
    let unit: Option<String> = row.get(4)?;
    let at: Option<String> = row.get(5)?;
    let cron: Option<String> = row.get(6)?;
    let timeout: Option<i64> = row.get(7)?;
    let max_retries: Option<i64> = row.get(8)?;
    let start_date: Option<String> = row.get(9)?;
    let end_date: Option<String> = row.get(10)?;
    let last_run: Option<String> = row.get(11)?;
    let next_run: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok((|| -> Result<Job, StoreError> {
        let params: TaskParams = serde_json::from_str(&params_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let schedule = match (cron, interval, unit) {
            (Some(expr), _, _) => Schedule::Cron(expr),
            (None, Some(interval), Some(unit)) => {
                let unit: TimeUnit = unit
                    .parse()
                    .map_err(|_| StoreError::Serialization(format!("bad time unit: {unit}")))?;
                Schedule::Interval {
                    interval: interval as u32,
                    unit,
                    at,
                }
            }
            _ => {
                return Err(StoreError::Serialization(format!(
                    "job {id} has no schedule shape"
                )))
            }
        };
        Ok(Job {
            id: JobId::new(id),
            task_name,
            params,
            schedule,
            options: crate::types::JobOptions {
                timeout: timeout.map(|v| v as u64),
                max_retries: max_retries.map(|v| v as u32),
                start_date: start_date.as_deref().map(parse_ts).transpose()?,
                end_date: end_date.as_deref().map(parse_ts).transpose()?,
            },
            last_run: last_run.as_deref().map(parse_ts).transpose()?,
            next_run: next_run.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<LogRecord, StoreError>> {
    let id: i64 = row.get(0)?;
    let job_id: Option<String> = row.get(1)?;
    let status: String = row.get(2)?;
    let started_at: String = row.get(3)?;
    let completed_at: Option<String> = row.get(4)?;
    let duration: Option<f64> = row.get(5)?;
    let result_json: Option<String> = row.get(6)?;
    let error: Option<String> = row.get(7)?;
    let retries: i64 = row.get(8)?;
    let created_at: String = row.get(9)?;

    Ok((|| -> Result<LogRecord, StoreError> {
        let status: LogStatus = status.parse().map_err(StoreError::Serialization)?;
        let result = result_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(LogRecord {
            id,
            job_id: job_id.map(JobId::new),
            status,
            started_at: parse_ts(&started_at)?,
            completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
            duration,
            result,
            error,
            retries: retries as u32,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

fn collect_rows<T, I>(rows: Result<I, rusqlite::Error>) -> Result<Vec<T>, StoreError>
where
    I: Iterator<Item = rusqlite::Result<Result<T, StoreError>>>,
{
    let rows = rows.map_err(|e| StoreError::Sqlite(e.to_string()))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| StoreError::Sqlite(e.to_string()))??);
    }
    Ok(out)
}

/// Extension trait so we can use `optional()` on rusqlite queries.
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
