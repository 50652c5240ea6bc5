//! Local-calendar evaluation of recurring schedules.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, Utc, Weekday};
use workoclock_storage::{RegularEvaluator, RegularPattern, RegularSchedule};

/// Evaluates recurring schedules against the host's local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct CalendarEvaluator;

impl RegularEvaluator for CalendarEvaluator {
    fn is_active(&self, schedule: &RegularSchedule, now: DateTime<Utc>) -> bool {
        is_active_at(&schedule.pattern, now.with_timezone(&Local).naive_local())
    }
}

/// Whether `pattern` blocks at the local wall-clock time `local`.
#[must_use]
pub fn is_active_at(pattern: &RegularPattern, local: NaiveDateTime) -> bool {
    match pattern {
        RegularPattern::DailyHours { from, to } => {
            let time = local.time();
            if from < to {
                *from <= time && time < *to
            } else {
                time >= *from || time < *to
            }
        }
        RegularPattern::Cycle {
            anchor,
            block_days,
            free_days,
        } => {
            let elapsed = (local.date() - *anchor).num_days();
            let period = i64::from(*block_days) + i64::from(*free_days);
            elapsed >= 0 && period > 0 && elapsed % period < i64::from(*block_days)
        }
        RegularPattern::Weekdays => !is_weekend(local.weekday()),
        RegularPattern::Weekends => is_weekend(local.weekday()),
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}
