//! Homeworq: a self-contained periodic job scheduler.
//!
//! Register async tasks by name, bind them to jobs with an interval,
//! time-of-day, or cron recurrence, and the engine executes each job on
//! its own cadence with per-attempt timeout and retry with backoff,
//! persisting jobs and execution logs in SQLite. An optional HTTP/JSON
//! control plane exposes the task catalog, job CRUD, logs, and analytics.
//!
//! ```no_run
//! use std::sync::Arc;
//! use homeworq::{Engine, Settings, TaskRegistry};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), homeworq::SchedulerError> {
//! let mut registry = TaskRegistry::new();
//! registry.register("hello", "Hello", None, |_params| async {
//!     Ok(serde_json::json!("world"))
//! })?;
//!
//! let engine = Arc::new(Engine::new(Settings::default(), registry, vec![])?);
//! engine.run().await // blocks until SIGINT/SIGTERM
//! # }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod executor;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod tasks;
pub mod types;

pub use config::{Config, ConfigError, Settings};
pub use engine::Engine;
pub use executor::Executor;
pub use registry::{Task, TaskRegistry};
pub use schedule::next_run;
pub use store::{default_job_id, LogFilter, SqliteStore, Store, StoreError};
pub use types::{
    Job, JobCreate, JobId, JobOptions, JobUpdate, LogRecord, LogStatus, Schedule, SchedulerError,
    TaskParams, TimeUnit,
};
