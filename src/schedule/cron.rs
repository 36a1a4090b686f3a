//! 5-field cron expression parser and next-fire calculator.
//!
//! Supported field syntax: `*`, exact integers, `a-b` ranges, `*/s` and
//! `a-b/s` steps, and comma-separated lists of any of those. Day-of-month
//! and day-of-week must both match (AND semantics). All evaluation is UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::types::SchedulerError;

/// Search horizon for the next fire time. Four years covers every
/// satisfiable expression (including Feb 29); anything still unmatched is
/// rejected as unsatisfiable.
const SEARCH_HORIZON_DAYS: i64 = 1462;

/// A parsed cron expression with each field expanded to its sorted set of
/// allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days: Vec<u32>,
    months: Vec<u32>,
    /// 0 = Sunday through 6 = Saturday.
    weekdays: Vec<u32>,
}

/// Field names and inclusive ranges, in expression order.
const FIELDS: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day", 1, 31),
    ("month", 1, 12),
    ("day_of_week", 0, 6),
];

impl CronExpr {
    /// Parse a 5-field expression: "minute hour day month day_of_week".
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(SchedulerError::InvalidCron(format!(
                "expected 5 fields (minute hour day month day_of_week), got {}",
                parts.len()
            )));
        }

        let mut fields = Vec::with_capacity(5);
        for (part, (name, min, max)) in parts.iter().copied().zip(FIELDS) {
            fields.push(parse_field(part, name, min, max)?);
        }
        let mut iter = fields.into_iter();
        Ok(Self {
            minutes: iter.next().unwrap(),
            hours: iter.next().unwrap(),
            days: iter.next().unwrap(),
            months: iter.next().unwrap(),
            weekdays: iter.next().unwrap(),
        })
    }

    /// First instant strictly after `after` (at minute precision) that
    /// satisfies every field.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        let mut current = truncate_to_minute(after) + Duration::minutes(1);
        let horizon = after + Duration::days(SEARCH_HORIZON_DAYS);

        loop {
            if current > horizon {
                return Err(SchedulerError::InvalidCron(
                    "expression never matches (no fire time within four years)".to_string(),
                ));
            }

            if !self.months.contains(&current.month()) {
                current = start_of_next_month(current);
                continue;
            }

            let dow = current.weekday().num_days_from_sunday();
            if !self.days.contains(&current.day()) || !self.weekdays.contains(&dow) {
                current = start_of_next_day(current);
                continue;
            }

            if !self.hours.contains(&current.hour()) {
                current = start_of_next_hour(current);
                continue;
            }

            if !self.minutes.contains(&current.minute()) {
                current += Duration::minutes(1);
                continue;
            }

            return Ok(current);
        }
    }
}

/// Expand a single field into its sorted, deduplicated value set.
fn parse_field(field: &str, name: &str, min: u32, max: u32) -> Result<Vec<u32>, SchedulerError> {
    let invalid = |detail: String| SchedulerError::InvalidCron(format!("{name}: {detail}"));
    let parse_int = |s: &str| -> Result<u32, SchedulerError> {
        s.parse::<u32>()
            .map_err(|_| invalid(format!("invalid value '{s}'")))
    };

    let mut values = Vec::new();
    for part in field.split(',') {
        if part == "*" {
            values.extend(min..=max);
            continue;
        }

        if let Some((range_part, step_part)) = part.split_once('/') {
            let step = parse_int(step_part)?;
            if step == 0 {
                return Err(invalid("step must be positive".to_string()));
            }
            let (start, end) = if range_part == "*" {
                (min, max)
            } else if let Some((a, b)) = range_part.split_once('-') {
                (parse_int(a)?, parse_int(b)?)
            } else {
                (parse_int(range_part)?, max)
            };
            values.extend((start..=end).step_by(step as usize));
            continue;
        }

        if let Some((a, b)) = part.split_once('-') {
            let (start, end) = (parse_int(a)?, parse_int(b)?);
            values.extend(start..=end);
            continue;
        }

        values.push(parse_int(part)?);
    }

    for value in &values {
        if *value < min || *value > max {
            return Err(invalid(format!("value {value} out of range ({min}-{max})")));
        }
    }

    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(invalid("no values".to_string()));
    }
    Ok(values)
}

fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), ts.minute(), 0)
        .single()
        .expect("valid UTC timestamp")
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

fn start_of_next_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    midnight_utc(ts.date_naive() + Duration::days(1))
}

fn start_of_next_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(ts) - Duration::minutes(ts.minute() as i64) + Duration::hours(1)
}

fn start_of_next_month(ts: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if ts.month() == 12 {
        (ts.year() + 1, 1)
    } else {
        (ts.year(), ts.month() + 1)
    };
    midnight_utc(NaiveDate::from_ymd_opt(year, month, 1).expect("first of month"))
}
