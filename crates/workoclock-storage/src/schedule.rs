//! Schedules describing when a preset is in force.
//!
//! Schedules are pure values: they never reference the preset that owns them.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Absolute time window, active on the half-open interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedSchedule {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FixedSchedule {
    /// # Errors
    ///
    /// Returns [`ValidationError::InvertedSchedule`] if `end` is before `start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        let schedule = Self { start, end };
        schedule.validate()?;
        Ok(schedule)
    }

    /// # Errors
    ///
    /// Returns [`ValidationError::Malformed`] if the end falls outside the
    /// representable range and [`ValidationError::InvertedSchedule`] for a
    /// negative `duration`.
    pub fn for_duration(start: DateTime<Utc>, duration: Duration) -> Result<Self, ValidationError> {
        let end = start.checked_add_signed(duration).ok_or_else(|| {
            ValidationError::Malformed(format!("window of {duration} from {start} is out of range"))
        })?;
        Self::new(start, end)
    }

    /// A window that starts at `start` and never ends in practice.
    #[must_use]
    pub fn forever_from(start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: never_ends(),
        }
    }

    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.end < self.start {
            return Err(ValidationError::InvertedSchedule);
        }
        Ok(())
    }
}

impl Default for FixedSchedule {
    fn default() -> Self {
        let now = Utc::now();
        now.checked_add_signed(Duration::days(1))
            .map_or_else(|| Self::forever_from(now), |end| Self { start: now, end })
    }
}

/// Latest instant that still renders as a plain four-digit ISO-8601 year.
fn never_ends() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|date| date.and_hms_opt(23, 59, 59))
        .map_or(DateTime::<Utc>::MAX_UTC, |naive| naive.and_utc())
}

/// Recurring blocking patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegularPattern {
    /// The same hours every day. `from > to` wraps past midnight.
    DailyHours { from: NaiveTime, to: NaiveTime },
    /// `block_days` blocked followed by `free_days` free, repeating from `anchor`.
    Cycle {
        anchor: NaiveDate,
        block_days: u32,
        free_days: u32,
    },
    Weekdays,
    Weekends,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularSchedule {
    pub pattern: RegularPattern,
}

impl RegularSchedule {
    #[must_use]
    pub fn new(pattern: RegularPattern) -> Self {
        Self { pattern }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self.pattern {
            RegularPattern::Cycle { block_days: 0, .. } => Err(ValidationError::Malformed(
                "cycle must block at least one day".to_string(),
            )),
            RegularPattern::DailyHours { from, to } if from == to => Err(
                ValidationError::Malformed("daily hours window is empty".to_string()),
            ),
            RegularPattern::Cycle { .. }
            | RegularPattern::DailyHours { .. }
            | RegularPattern::Weekdays
            | RegularPattern::Weekends => Ok(()),
        }
    }
}

/// Resolves whether a recurring schedule is active.
///
/// Recurring rules depend on the enforcing host (local calendar, time zone),
/// so their evaluation is supplied by whoever enforces the preset.
pub trait RegularEvaluator: Send + Sync {
    fn is_active(&self, schedule: &RegularSchedule, now: DateTime<Utc>) -> bool;
}

/// Treats every recurring schedule as inactive.
#[derive(Debug, Default, Clone, Copy)]
pub struct InactiveRegular;

impl RegularEvaluator for InactiveRegular {
    fn is_active(&self, _schedule: &RegularSchedule, _now: DateTime<Utc>) -> bool {
        false
    }
}

/// The schedule attached to a preset. Serialized with a `kind` discriminant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockSchedule {
    Fixed(FixedSchedule),
    Regular(RegularSchedule),
}

impl BlockSchedule {
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>, regular: &dyn RegularEvaluator) -> bool {
        match self {
            Self::Fixed(fixed) => fixed.is_active(now),
            Self::Regular(schedule) => regular.is_active(schedule, now),
        }
    }

    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first inconsistency found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Fixed(fixed) => fixed.validate(),
            Self::Regular(schedule) => schedule.validate(),
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Fixed(fixed) if fixed.end == never_ends() => {
                format!("from {}", fixed.start.format("%Y-%m-%d %H:%M"))
            }
            Self::Fixed(fixed) => format!(
                "{} -> {}",
                fixed.start.format("%Y-%m-%d %H:%M"),
                fixed.end.format("%Y-%m-%d %H:%M")
            ),
            Self::Regular(RegularSchedule { pattern }) => match pattern {
                RegularPattern::DailyHours { from, to } => {
                    format!("daily {} -> {}", from.format("%H:%M"), to.format("%H:%M"))
                }
                RegularPattern::Cycle {
                    block_days,
                    free_days,
                    ..
                } => format!("{block_days} days on / {free_days} days off"),
                RegularPattern::Weekdays => "weekdays".to_string(),
                RegularPattern::Weekends => "weekends".to_string(),
            },
        }
    }
}

impl Default for BlockSchedule {
    fn default() -> Self {
        Self::Fixed(FixedSchedule::default())
    }
}

impl From<FixedSchedule> for BlockSchedule {
    fn from(schedule: FixedSchedule) -> Self {
        Self::Fixed(schedule)
    }
}

impl From<RegularSchedule> for BlockSchedule {
    fn from(schedule: RegularSchedule) -> Self {
        Self::Regular(schedule)
    }
}
