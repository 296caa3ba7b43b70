//! Schedule validation and next-run computation.
//!
//! Five-field expressions (`min hour dom mon dow`) use the classic crontab
//! dialect, Sunday being `0` or `7`, evaluated in the host's local time zone.
//! Six- and seven-field expressions (leading seconds, optional year) are
//! handed to the `cron` crate unchanged.

use std::str::FromStr;

use chrono::{DateTime, Local};

use crate::error::CronError;
use crate::{CronSchedule, ScheduleKind};

const WEEKDAYS: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Check that a schedule is well formed.
pub fn validate(schedule: &CronSchedule) -> Result<(), CronError> {
    match (schedule.kind, schedule.every_ms, schedule.expr.as_deref()) {
        (ScheduleKind::Every, Some(0), None) => Err(CronError::Validation(
            "every_ms must be greater than zero".into(),
        )),
        (ScheduleKind::Every, Some(_), None) => Ok(()),
        (ScheduleKind::Cron, None, Some(expr)) => parse(expr).map(|_| ()),
        _ => Err(CronError::Validation(
            "exactly one of every_ms or expr must be set, matching the schedule kind".into(),
        )),
    }
}

/// First run time strictly after `after_ms`.
///
/// `None` means the schedule has no further occurrence.
pub fn next_run_after(schedule: &CronSchedule, after_ms: i64) -> Result<Option<i64>, CronError> {
    validate(schedule)?;
    match (schedule.every_ms, schedule.expr.as_deref()) {
        (Some(every_ms), _) => Ok(Some(
            after_ms.saturating_add(i64::try_from(every_ms).unwrap_or(i64::MAX)),
        )),
        (None, Some(expr)) => {
            let parsed = parse(expr)?;
            let after = DateTime::from_timestamp_millis(after_ms)
                .ok_or_else(|| invalid(expr, format!("timestamp {after_ms} out of range")))?
                .with_timezone(&Local);
            Ok(parsed.after(&after).next().map(|t| t.timestamp_millis()))
        }
        (None, None) => Ok(None),
    }
}

/// Parse an expression in either dialect.
pub fn parse(expr: &str) -> Result<cron::Schedule, CronError> {
    let normalized = normalize(expr)?;
    cron::Schedule::from_str(&normalized).map_err(|e| invalid(expr, e.to_string()))
}

/// Rewrite a five-field expression into the `cron` crate's seconds-first form.
fn normalize(expr: &str) -> Result<String, CronError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let weekdays = translate_weekdays(fields[4]).map_err(|reason| invalid(expr, reason))?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], weekdays
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(invalid(expr, format!("expected 5, 6 or 7 fields, got {n}"))),
    }
}

/// Map crontab weekday numbers (0-7, Sunday = 0 or 7) onto names, which the
/// `cron` crate reads unambiguously.
fn translate_weekdays(field: &str) -> Result<String, String> {
    let items = field
        .split(',')
        .map(translate_weekday_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items.join(","))
}

fn translate_weekday_item(item: &str) -> Result<String, String> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };

    let translated = match base.split_once('-') {
        // 7 closing a range means Sunday at the end of the week.
        Some((start, "7")) if step.is_none() && start != "0" && start != "7" => {
            format!("{}-Sat,Sun", weekday(start)?)
        }
        Some((start, "7")) => format!("{}-Sat", weekday(start)?),
        Some((start, end)) => format!("{}-{}", weekday(start)?, weekday(end)?),
        None => weekday(base)?,
    };

    Ok(match step {
        Some(step) => format!("{translated}/{step}"),
        None => translated,
    })
}

fn weekday(token: &str) -> Result<String, String> {
    if !token.bytes().all(|b| b.is_ascii_digit()) || token.is_empty() {
        return Ok(token.to_string());
    }
    token
        .parse::<usize>()
        .ok()
        .and_then(|n| WEEKDAYS.get(n))
        .map(|name| name.to_string())
        .ok_or_else(|| format!("day of week {token} out of range 0-7"))
}

pub(crate) fn invalid(expr: &str, reason: impl Into<String>) -> CronError {
    CronError::InvalidSchedule {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}
