//! Preset management commands

use anyhow::Result;
use chrono::{DateTime, Duration, Local, Utc};
use clap::{Args, Subcommand};
use std::collections::BTreeSet;
use tabled::{Table, Tabled};
use workoclock_core::calendar::CalendarEvaluator;
use workoclock_storage::{
    AppCategory, BlockSchedule, FixedSchedule, PresetStore, RegularSchedule, SettingPreset,
};

use super::helpers::{parse_instant, parse_pattern, truncate_str, yes_no};

#[derive(Subcommand, Debug)]
pub enum PresetAction {
    /// List all presets
    List,
    /// Show one preset as stored
    Show {
        /// Preset name
        name: String,
    },
    /// Create a new preset (disabled unless --enable is given)
    Create {
        /// Preset name
        name: String,
        #[command(flatten)]
        categories: CategoryArgs,
        #[command(flatten)]
        schedule: ScheduleArgs,
        /// Also block applications detected as belonging to the categories
        #[arg(long)]
        autodetect: bool,
        /// Enforce the preset as soon as its schedule is active
        #[arg(long)]
        enable: bool,
        /// Overwrite an existing preset with the same name
        #[arg(short, long)]
        force: bool,
    },
    /// Change an existing preset
    Edit {
        /// Current preset name
        name: String,
        /// New name for the preset
        #[arg(long, value_name = "NAME")]
        rename: Option<String>,
        #[command(flatten)]
        categories: CategoryArgs,
        #[command(flatten)]
        schedule: ScheduleArgs,
        /// Turn autodetection on or off
        #[arg(long, value_name = "BOOL")]
        autodetect: Option<bool>,
        /// Turn the preset on or off
        #[arg(long, value_name = "BOOL")]
        enable: Option<bool>,
    },
    /// Delete a preset
    Delete {
        /// Preset name
        name: String,
        /// Succeed even if the preset does not exist
        #[arg(long)]
        missing_ok: bool,
    },
}

#[derive(Args, Debug)]
pub struct CategoryArgs {
    /// Category to block: messenger, game, video, music, study (repeatable)
    #[arg(short, long = "category", value_name = "CODE", value_delimiter = ',')]
    categories: Vec<String>,
    /// Block every category
    #[arg(long, conflicts_with = "categories")]
    all: bool,
}

impl CategoryArgs {
    /// `None` when no category option was given.
    fn resolve(&self) -> Result<Option<BTreeSet<AppCategory>>> {
        if self.all {
            return Ok(Some(AppCategory::all()));
        }
        if self.categories.is_empty() {
            return Ok(None);
        }
        let categories = self
            .categories
            .iter()
            .map(|code| code.parse::<AppCategory>())
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Some(categories))
    }
}

#[derive(Args, Debug)]
pub struct ScheduleArgs {
    /// Window start, RFC 3339 or local 'YYYY-MM-DD HH:MM' (default: now)
    #[arg(long, value_name = "TIME", conflicts_with = "repeat")]
    start: Option<String>,
    /// Window end, same formats as --start
    #[arg(long, value_name = "TIME", conflicts_with_all = ["for_hours", "forever", "repeat"])]
    end: Option<String>,
    /// Window length in hours from the start
    #[arg(long, value_name = "HOURS", conflicts_with_all = ["forever", "repeat"])]
    for_hours: Option<u32>,
    /// Window that never ends
    #[arg(long, conflicts_with = "repeat")]
    forever: bool,
    /// Recurring pattern: weekdays, weekends, HH:MM-HH:MM or N/M (days on/off)
    #[arg(long, value_name = "PATTERN")]
    repeat: Option<String>,
}

impl ScheduleArgs {
    /// `None` when no schedule option was given.
    fn resolve(&self, now: DateTime<Utc>) -> Result<Option<BlockSchedule>> {
        if let Some(pattern) = &self.repeat {
            let today = now.with_timezone(&Local).date_naive();
            let schedule = RegularSchedule::new(parse_pattern(pattern, today)?);
            return Ok(Some(schedule.into()));
        }

        if self.start.is_none() && self.end.is_none() && self.for_hours.is_none() && !self.forever {
            return Ok(None);
        }

        let start = match &self.start {
            Some(start) => parse_instant(start)?,
            None => now,
        };
        let fixed = if self.forever {
            FixedSchedule::forever_from(start)
        } else if let Some(end) = &self.end {
            FixedSchedule::new(start, parse_instant(end)?)?
        } else {
            let hours = self.for_hours.unwrap_or(24);
            FixedSchedule::for_duration(start, Duration::hours(i64::from(hours)))?
        };
        Ok(Some(fixed.into()))
    }
}

#[derive(Tabled)]
struct PresetRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Enabled")]
    enabled: &'static str,
    #[tabled(rename = "Active")]
    active: &'static str,
    #[tabled(rename = "Categories")]
    categories: String,
    #[tabled(rename = "Autodetect")]
    autodetect: &'static str,
    #[tabled(rename = "Schedule")]
    schedule: String,
}

impl PresetRow {
    fn new(preset: &SettingPreset, now: DateTime<Utc>) -> Self {
        Self {
            name: preset.name().to_string(),
            enabled: yes_no(preset.enable()),
            active: yes_no(preset.is_active(now, &CalendarEvaluator)),
            categories: truncate_str(&category_list(preset), 40),
            autodetect: yes_no(preset.autodetect()),
            schedule: preset.schedule().describe(),
        }
    }
}

fn category_list(preset: &SettingPreset) -> String {
    if preset.block_categories().is_empty() {
        return "-".to_string();
    }
    preset
        .block_categories()
        .iter()
        .map(|category| category.code())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Handle preset commands against `store`
///
/// # Errors
///
/// Returns an error if the arguments are invalid or the store rejects the change
pub fn handle_preset_command(action: PresetAction, store: &PresetStore) -> Result<()> {
    run_action(action, store, Utc::now())
}

fn run_action(action: PresetAction, store: &PresetStore, now: DateTime<Utc>) -> Result<()> {
    match action {
        PresetAction::List => list_presets(store, now),
        PresetAction::Show { name } => show_preset(store, &name, now),
        PresetAction::Create {
            name,
            categories,
            schedule,
            autodetect,
            enable,
            force,
        } => {
            let categories = categories.resolve()?.unwrap_or_default();
            let schedule = match schedule.resolve(now)? {
                Some(schedule) => schedule,
                None => FixedSchedule::for_duration(now, Duration::days(1))?.into(),
            };
            let preset = SettingPreset::new(name, categories, schedule)?
                .with_autodetect(autodetect)
                .with_enable(enable);
            store.create(&preset, force)?;
            println!("Created preset '{}': {}", preset.name(), preset.schedule().describe());
            Ok(())
        }
        PresetAction::Edit {
            name,
            rename,
            categories,
            schedule,
            autodetect,
            enable,
        } => {
            let mut preset = store.get(&name)?;
            if let Some(new_name) = rename {
                preset.rename(new_name)?;
            }
            if let Some(categories) = categories.resolve()? {
                preset.set_categories(categories);
            }
            if let Some(schedule) = schedule.resolve(now)? {
                preset.set_schedule(schedule)?;
            }
            if let Some(autodetect) = autodetect {
                preset.set_autodetect(autodetect);
            }
            if let Some(enable) = enable {
                preset.set_enable(enable);
            }
            store.update(&name, &preset)?;
            println!("Updated preset '{}'", preset.name());
            Ok(())
        }
        PresetAction::Delete { name, missing_ok } => {
            store.delete(&name, !missing_ok)?;
            println!("Deleted preset '{name}'");
            Ok(())
        }
    }
}

fn list_presets(store: &PresetStore, now: DateTime<Utc>) -> Result<()> {
    let rows: Vec<PresetRow> = store
        .load_all()?
        .iter()
        .map(|preset| PresetRow::new(preset, now))
        .collect();

    println!("\nPresets ({}/{})", rows.len(), store.max_presets());
    println!("{}", "=".repeat(50));
    println!("{}", Table::new(rows));
    Ok(())
}

fn show_preset(store: &PresetStore, name: &str, now: DateTime<Utc>) -> Result<()> {
    let preset = store.get(name)?;
    println!("{}", serde_json::to_string_pretty(&preset.to_record())?);
    println!("\nActive now: {}", yes_no(preset.is_active(now, &CalendarEvaluator)));
    Ok(())
}
