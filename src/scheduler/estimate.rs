//! Wait-time projection for a machine's queue.

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SchedulerError};
use crate::scheduler::machine::{Machine, MachineStatus};

/// Converts fractional hours to a duration at millisecond resolution.
/// `None` when the value is not finite or does not fit a duration.
pub fn hours(value: f64) -> Option<Duration> {
    let millis = value * 3_600_000.0;
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(millis.round() as i64)
}

/// `at` shifted by `value` hours, or `InvalidRequest` if that leaves the
/// representable calendar.
pub fn after(at: DateTime<Utc>, value: f64) -> Result<DateTime<Utc>> {
    hours(value)
        .and_then(|offset| at.checked_add_signed(offset))
        .ok_or_else(|| {
            SchedulerError::InvalidRequest(format!(
                "{} hours after {} is out of range",
                value, at
            ))
        })
}

/// Time until the machine finishes its current job or cooldown.
///
/// Idle machines have nothing left to run. Otherwise the machine's
/// estimated-available timestamp is trusted when it lies in the future.
pub fn remaining(machine: &Machine, now: DateTime<Utc>) -> Duration {
    if machine.status() == MachineStatus::Idle {
        return Duration::zero();
    }
    match machine.estimated_available_at() {
        Some(at) if at > now => at - now,
        _ => Duration::zero(),
    }
}

/// Projected start time for each queued entry, given their durations in rank order.
pub fn project_starts(
    machine: &Machine,
    durations: &[f64],
    now: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>> {
    let mut cursor = now + remaining(machine, now);
    let mut starts = Vec::with_capacity(durations.len());
    for &duration in durations {
        starts.push(cursor);
        cursor = after(after(cursor, duration)?, machine.cooldown_hours)?;
    }
    Ok(starts)
}

/// When a new entry appended behind `durations` would start.
pub fn tail_start(machine: &Machine, durations: &[f64], now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    durations
        .iter()
        .try_fold(now + remaining(machine, now), |cursor, &duration| {
            after(after(cursor, duration)?, machine.cooldown_hours)
        })
}
