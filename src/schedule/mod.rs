//! Recurrence calculation: given a schedule and a reference instant,
//! compute the next UTC fire time. Pure and side-effect free.

pub mod cron;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::types::{Schedule, SchedulerError, TimeUnit};
use cron::CronExpr;

/// Next fire time for `schedule`, strictly or weakly after `now`.
///
/// For plain interval schedules with a `last_run`, the result is
/// `last_run + k * step` for the smallest `k` making it strictly greater
/// than `now` — catch-up without backlog replay. Time-of-day schedules
/// always anchor on the wall clock and ignore `last_run`.
pub fn next_run(
    schedule: &Schedule,
    now: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, SchedulerError> {
    match schedule {
        Schedule::Cron(expr) => CronExpr::parse(expr)?.next_after(now),
        Schedule::Interval {
            interval,
            unit,
            at: Some(at),
        } => next_run_at(*interval, *unit, at, now),
        Schedule::Interval {
            interval,
            unit,
            at: None,
        } => next_run_interval(*interval, *unit, now, last_run),
    }
}

fn next_run_at(
    interval: u32,
    unit: TimeUnit,
    at: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    if !matches!(unit, TimeUnit::Days | TimeUnit::Weeks) {
        return Err(SchedulerError::InvalidSchedule(
            "time-of-day scheduling only supported for daily/weekly jobs".to_string(),
        ));
    }
    let (hour, minute) = parse_at(at)?;
    let today = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), hour, minute, 0)
        .single()
        .expect("valid UTC time of day");

    if today > now {
        return Ok(today);
    }
    let days = match unit {
        TimeUnit::Days => interval as i64,
        TimeUnit::Weeks => interval as i64 * 7,
        _ => unreachable!(),
    };
    Ok(today + Duration::days(days))
}

fn next_run_interval(
    interval: u32,
    unit: TimeUnit,
    now: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, SchedulerError> {
    match unit {
        TimeUnit::Months | TimeUnit::Years => {
            let months = match unit {
                TimeUnit::Months => interval as i32,
                _ => interval as i32 * 12,
            };
            match last_run {
                None => Ok(add_months(now, months)),
                Some(last) => {
                    // Anchor on last_run so a clamped day (e.g. Jan 31 →
                    // Feb 28) springs back in longer months.
                    let mut k = 1;
                    let mut next = add_months(last, months);
                    while next <= now {
                        k += 1;
                        next = add_months(last, months * k);
                    }
                    Ok(next)
                }
            }
        }
        _ => {
            let step = fixed_step(interval, unit);
            match last_run {
                None => Ok(now + step),
                Some(last) => {
                    let step_secs = step.num_seconds().max(1);
                    let elapsed = (now - last).num_seconds();
                    let k = if elapsed < 0 { 1 } else { elapsed / step_secs + 1 };
                    Ok(last + Duration::seconds(step_secs * k))
                }
            }
        }
    }
}

fn fixed_step(interval: u32, unit: TimeUnit) -> Duration {
    let n = interval as i64;
    match unit {
        TimeUnit::Seconds => Duration::seconds(n),
        TimeUnit::Minutes => Duration::minutes(n),
        TimeUnit::Hours => Duration::hours(n),
        TimeUnit::Days => Duration::days(n),
        TimeUnit::Weeks => Duration::weeks(n),
        TimeUnit::Months | TimeUnit::Years => unreachable!("calendar units handled separately"),
    }
}

/// Calendar-aware month offset: the nominal day-of-month is preserved and
/// clamped to the target month's last day when shorter.
fn add_months(ts: DateTime<Utc>, months: i32) -> DateTime<Utc> {
    let total = ts.year() * 12 + ts.month() as i32 - 1 + months;
    let year = total.div_euclid(12);
    let month = (total.rem_euclid(12) + 1) as u32;
    let day = ts.day().min(days_in_month(year, month));
    let date = NaiveDate::from_ymd_opt(year, month, day).expect("clamped day is valid");
    let time = date
        .and_hms_opt(ts.hour(), ts.minute(), ts.second())
        .expect("time of day carries over");
    Utc.from_utc_datetime(&time)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("first of month")
        .pred_opt()
        .expect("previous day exists")
        .day()
}

fn parse_at(at: &str) -> Result<(u32, u32), SchedulerError> {
    let invalid =
        || SchedulerError::InvalidSchedule(format!("'at' must be in HH:MM format, got '{at}'"));
    let (h, m) = at.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = h.parse().map_err(|_| invalid())?;
    let minute: u32 = m.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}
