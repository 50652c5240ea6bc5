//! Helper utility functions for CLI commands

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use workoclock_storage::RegularPattern;

/// Safely truncate a string to a maximum number of characters (not bytes).
/// This avoids panics when slicing multi-byte UTF-8 characters.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count > max_chars {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{truncated}...")
    } else {
        s.to_string()
    }
}

pub fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Parse an instant given either as RFC 3339 or as local `YYYY-MM-DD HH:MM`.
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M"))
        .with_context(|| {
            format!("Invalid time '{value}': use RFC 3339 or 'YYYY-MM-DD HH:MM'")
        })?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("Local time '{value}' is ambiguous or does not exist"))
}

/// Parse a recurring pattern: `weekdays`, `weekends`, `HH:MM-HH:MM` (daily
/// hours) or `N/M` (N days blocked, M days free, starting `today`).
pub fn parse_pattern(value: &str, today: NaiveDate) -> Result<RegularPattern> {
    let value = value.trim();
    match value.to_lowercase().as_str() {
        "weekdays" => return Ok(RegularPattern::Weekdays),
        "weekends" => return Ok(RegularPattern::Weekends),
        _ => {}
    }

    if let Some((from, to)) = value.split_once('-') {
        let parse_time = |s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M")
                .with_context(|| format!("Invalid time of day '{s}', expected HH:MM"))
        };
        return Ok(RegularPattern::DailyHours {
            from: parse_time(from)?,
            to: parse_time(to)?,
        });
    }

    if let Some((block, free)) = value.split_once('/') {
        let parse_days = |s: &str| {
            s.trim()
                .parse::<u32>()
                .with_context(|| format!("Invalid day count '{s}'"))
        };
        return Ok(RegularPattern::Cycle {
            anchor: today,
            block_days: parse_days(block)?,
            free_days: parse_days(free)?,
        });
    }

    anyhow::bail!(
        "Unknown pattern '{value}': use weekdays, weekends, HH:MM-HH:MM or N/M"
    )
}
