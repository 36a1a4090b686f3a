//! Core data types shared across the engine.

pub mod error;
pub mod job;
pub mod log;

pub use error::SchedulerError;
pub use job::{Job, JobCreate, JobId, JobOptions, JobUpdate, Schedule, TaskParams, TimeUnit};
pub use log::{LogRecord, LogStatus};
