//! Cron-schedule backoff computation.
//!
//! Cron workflows re-fire by continue-as-new: when a run closes, the engine
//! computes the seconds until the schedule's next fire after the run's start
//! time and records it as the successor's first-decision backoff.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::EngineError;

/// Validate a caller-supplied cron schedule. Empty means "not a cron
/// workflow" and is always valid.
pub fn validate_schedule(schedule: &str) -> Result<(), EngineError> {
    if schedule.is_empty() {
        return Ok(());
    }
    parse(schedule).map(|_| ())
}

/// Backoff in milliseconds from `now_ms` until the next fire of `schedule`
/// strictly after `start_time_ms`. `None` when the workflow has no schedule.
///
/// The reference point is the run's start time, matching re-fire semantics:
/// a run that outlives its own interval continues immediately on the next
/// boundary after start rather than skipping ahead of `now`.
pub fn backoff_to_next_fire(schedule: &str, start_time_ms: i64, now_ms: i64) -> Option<i64> {
    if schedule.is_empty() {
        return None;
    }
    let parsed = parse(schedule).ok()?;
    let reference_ms = start_time_ms.max(now_ms);
    let reference = DateTime::<Utc>::from_timestamp_millis(reference_ms)?;
    let next = parsed.after(&reference).next()?;
    let backoff = next.timestamp_millis() - now_ms;
    Some(backoff.max(0))
}

/// Seconds variant of [`backoff_to_next_fire`], rounded up so a fire never
/// lands before the boundary.
pub fn backoff_seconds_to_next_fire(schedule: &str, start_time_ms: i64, now_ms: i64) -> Option<i32> {
    backoff_to_next_fire(schedule, start_time_ms, now_ms).map(|ms| ((ms + 999) / 1000) as i32)
}

// The cron crate expects a seconds field; callers write classic five-field
// expressions, so a zero-seconds field is prepended when absent.
fn parse(schedule: &str) -> Result<Schedule, EngineError> {
    let fields = schedule.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {schedule}")
    } else {
        schedule.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| EngineError::bad_request(format!("Invalid CronSchedule: {e}")))
}
