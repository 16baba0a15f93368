//! Cron expression handling: [`parse`] validates an expression and
//! [`CronSchedule::next_after`] computes the next start time.

use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use cron::Schedule;

use crate::errors::OverseerError;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First occurrence strictly after `from`, evaluated in local time.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&Local))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }
}

pub fn parse(expr: &str) -> Result<CronSchedule, OverseerError> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(invalid(expr, "expression is empty"));
    }

    let schedule = Schedule::from_str(&normalize(trimmed))
        .map_err(|err| invalid(expr, &err.to_string()))?;
    Ok(CronSchedule {
        expr: trimmed.to_string(),
        schedule,
    })
}

/// Parses `expr` and returns its next occurrence after `from`.
pub fn next_occurrence(expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, OverseerError> {
    parse(expr)?
        .next_after(from)
        .ok_or_else(|| invalid(expr, "expression has no upcoming occurrence"))
}

// Standard 5-field cron ("m h dom mon dow") gets a leading seconds field and
// its weekdays moved from 0-7 (Sunday = 0 or 7) to the 1-7 (Sunday = 1) the
// cron crate expects.
fn normalize(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day, month, weekday] => format!(
            "0 {minute} {hour} {day} {month} {}",
            shift_weekdays(weekday)
        ),
        _ => expr.to_string(),
    }
}

fn shift_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(shift_weekday_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_weekday_item(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };

    let shifted = match base.split_once('-') {
        Some((from, to)) => match (weekday_number(from), weekday_number(to)) {
            (Some(0), Some(7)) if step.is_none() => "1-7".to_string(),
            // "5-7" ends on Sunday, which now sits at the start of the week.
            (Some(from), Some(7)) if step.is_none() => format!("{}-7,1", from + 1),
            (Some(from), Some(to)) => format!("{}-{}", from + 1, (to + 1).min(7)),
            _ => base.to_string(),
        },
        None => match weekday_number(base) {
            Some(day) => (day % 7 + 1).to_string(),
            None => base.to_string(),
        },
    };

    match step {
        Some(step) => format!("{shifted}/{step}"),
        None => shifted,
    }
}

fn weekday_number(value: &str) -> Option<u32> {
    value.parse::<u32>().ok().filter(|day| *day <= 7)
}

fn invalid(expr: &str, reason: &str) -> OverseerError {
    OverseerError::InvalidCronExpression {
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}
