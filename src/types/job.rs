//! Job definitions: schedules, options, and the persisted job record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SchedulerError;
use crate::schedule::cron::CronExpr;

/// Unique identifier for a job.
///
/// Default jobs use the hex SHA-256 of their canonical `{task, params}`
/// JSON so that re-declaring the same job across restarts maps onto the
/// same row. Dynamically created jobs get a random hex UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier for a dynamically created job.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Time unit for interval schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
            TimeUnit::Years => "years",
        }
    }

    /// Singular form, used when rendering "every hour" style labels.
    fn singular(&self) -> &'static str {
        let s = self.as_str();
        &s[..s.len() - 1]
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TimeUnit {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seconds" => Ok(TimeUnit::Seconds),
            "minutes" => Ok(TimeUnit::Minutes),
            "hours" => Ok(TimeUnit::Hours),
            "days" => Ok(TimeUnit::Days),
            "weeks" => Ok(TimeUnit::Weeks),
            "months" => Ok(TimeUnit::Months),
            "years" => Ok(TimeUnit::Years),
            other => Err(SchedulerError::InvalidSchedule(format!(
                "unknown time unit: {other}"
            ))),
        }
    }
}

/// Recurrence rule for a job. Exactly one shape: a fixed interval
/// (optionally pinned to a UTC time of day) or a 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Schedule {
    Interval {
        interval: u32,
        unit: TimeUnit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<String>,
    },
    Cron(String),
}

impl Schedule {
    /// Validate the schedule, returning a normalised copy.
    ///
    /// `at` times come back zero-padded ("8:5" → "08:05"); cron
    /// expressions are checked field by field.
    pub fn validated(&self) -> Result<Schedule, SchedulerError> {
        match self {
            Schedule::Interval { interval, unit, at } => {
                if *interval == 0 {
                    return Err(SchedulerError::InvalidSchedule(
                        "interval must be positive".to_string(),
                    ));
                }
                let at = match at {
                    Some(raw) => {
                        if !matches!(unit, TimeUnit::Days | TimeUnit::Weeks) {
                            return Err(SchedulerError::InvalidSchedule(
                                "time-of-day scheduling only supported for daily/weekly jobs"
                                    .to_string(),
                            ));
                        }
                        Some(normalize_at(raw)?)
                    }
                    None => None,
                };
                Ok(Schedule::Interval {
                    interval: *interval,
                    unit: *unit,
                    at,
                })
            }
            Schedule::Cron(expr) => {
                CronExpr::parse(expr)?;
                Ok(Schedule::Cron(expr.clone()))
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval { interval, unit, at } => {
                if *interval == 1 {
                    write!(f, "every {}", unit.singular())?;
                } else {
                    write!(f, "every {} {}", interval, unit)?;
                }
                if let Some(at) = at {
                    write!(f, " at {at}")?;
                }
                Ok(())
            }
            Schedule::Cron(expr) => write!(f, "on cron '{expr}'"),
        }
    }
}

/// Parse and zero-pad an "HH:MM" time-of-day string.
pub fn normalize_at(raw: &str) -> Result<String, SchedulerError> {
    let invalid =
        || SchedulerError::InvalidJob("'at' must be in HH:MM format (00:00-23:59)".to_string());
    let (h, m) = raw.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = h.trim().parse().map_err(|_| invalid())?;
    let minute: u32 = m.trim().parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok(format!("{hour:02}:{minute:02}"))
}

/// Execution options attached to a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Per-attempt deadline in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Extra attempts after the first (0-10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl JobOptions {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err(SchedulerError::InvalidJob(
                    "timeout must be at least 1 second".to_string(),
                ));
            }
        }
        if let Some(retries) = self.max_retries {
            if retries > 10 {
                return Err(SchedulerError::InvalidJob(
                    "max_retries must be between 0 and 10".to_string(),
                ));
            }
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end <= start {
                return Err(SchedulerError::InvalidJob(
                    "end_date must be after start_date".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Parameters handed to a task at invocation time.
pub type TaskParams = serde_json::Map<String, serde_json::Value>;

/// A job as submitted by the operator (config defaults or API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreate {
    pub task: String,
    #[serde(default)]
    pub params: TaskParams,
    #[serde(default)]
    pub options: JobOptions,
    pub schedule: Schedule,
}

impl JobCreate {
    /// Validate the definition, returning a normalised copy.
    pub fn validated(&self) -> Result<JobCreate, SchedulerError> {
        self.options.validate()?;
        Ok(JobCreate {
            task: self.task.clone(),
            params: self.params.clone(),
            options: self.options.clone(),
            schedule: self.schedule.validated()?,
        })
    }
}

/// Partial update to an existing job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(default)]
    pub params: Option<TaskParams>,
    #[serde(default)]
    pub options: Option<JobOptions>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_name: String,
    pub params: TaskParams,
    pub schedule: Schedule,
    #[serde(flatten)]
    pub options: JobOptions,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Display label built from the schedule and task name, e.g.
    /// "Every 2 hours: ping".
    pub fn display_name(&self) -> String {
        let schedule = self.schedule.to_string();
        let mut chars = schedule.chars();
        let schedule = match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => schedule,
        };
        format!("{}: {}", schedule, self.task_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_at_pads_and_validates() {
        assert_eq!(normalize_at("8:5").unwrap(), "08:05");
        assert_eq!(normalize_at("23:59").unwrap(), "23:59");
        assert!(normalize_at("24:00").is_err());
        assert!(normalize_at("12:60").is_err());
        assert!(normalize_at("noon").is_err());
    }

    #[test]
    fn schedule_at_requires_daily_or_weekly() {
        let s = Schedule::Interval {
            interval: 1,
            unit: TimeUnit::Hours,
            at: Some("02:00".to_string()),
        };
        assert!(matches!(
            s.validated(),
            Err(SchedulerError::InvalidSchedule(_))
        ));

        let s = Schedule::Interval {
            interval: 1,
            unit: TimeUnit::Days,
            at: Some("2:0".to_string()),
        };
        let normalised = s.validated().unwrap();
        assert_eq!(
            normalised,
            Schedule::Interval {
                interval: 1,
                unit: TimeUnit::Days,
                at: Some("02:00".to_string()),
            }
        );
    }

    #[test]
    fn schedule_rejects_zero_interval() {
        let s = Schedule::Interval {
            interval: 0,
            unit: TimeUnit::Minutes,
            at: None,
        };
        assert!(s.validated().is_err());
    }

    #[test]
    fn schedule_deserializes_both_shapes() {
        let interval: Schedule =
            serde_json::from_str(r#"{"interval": 5, "unit": "minutes"}"#).unwrap();
        assert_eq!(
            interval,
            Schedule::Interval {
                interval: 5,
                unit: TimeUnit::Minutes,
                at: None
            }
        );

        let cron: Schedule = serde_json::from_str(r#""*/15 * * * *""#).unwrap();
        assert_eq!(cron, Schedule::Cron("*/15 * * * *".to_string()));
    }

    #[test]
    fn options_validate_ranges() {
        let ok = JobOptions {
            timeout: Some(30),
            max_retries: Some(10),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        let bad_retries = JobOptions {
            max_retries: Some(11),
            ..Default::default()
        };
        assert!(bad_retries.validate().is_err());

        let bad_timeout = JobOptions {
            timeout: Some(0),
            ..Default::default()
        };
        assert!(bad_timeout.validate().is_err());
    }

    #[test]
    fn options_validate_date_order() {
        let start = Utc::now();
        let bad = JobOptions {
            start_date: Some(start),
            end_date: Some(start),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let ok = JobOptions {
            start_date: Some(start),
            end_date: Some(start + chrono::Duration::days(1)),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn schedule_display() {
        let s = Schedule::Interval {
            interval: 1,
            unit: TimeUnit::Hours,
            at: None,
        };
        assert_eq!(s.to_string(), "every hour");

        let s = Schedule::Interval {
            interval: 2,
            unit: TimeUnit::Days,
            at: Some("08:00".to_string()),
        };
        assert_eq!(s.to_string(), "every 2 days at 08:00");

        let s = Schedule::Cron("0 * * * *".to_string());
        assert_eq!(s.to_string(), "on cron '0 * * * *'");
    }
}
