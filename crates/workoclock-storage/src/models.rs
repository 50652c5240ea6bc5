use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::schedule::{BlockSchedule, FixedSchedule, RegularEvaluator};

/// Application classes a preset can block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppCategory {
    Messenger,
    Game,
    Video,
    Music,
    Study,
}

impl AppCategory {
    pub const ALL: [AppCategory; 5] = [
        AppCategory::Messenger,
        AppCategory::Game,
        AppCategory::Video,
        AppCategory::Music,
        AppCategory::Study,
    ];

    #[must_use]
    pub fn all() -> BTreeSet<AppCategory> {
        Self::ALL.into_iter().collect()
    }

    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Messenger => "messenger",
            Self::Game => "game",
            Self::Video => "video",
            Self::Music => "music",
            Self::Study => "study",
        }
    }
}

impl fmt::Display for AppCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for AppCategory {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|category| category.code() == code)
            .ok_or_else(|| ValidationError::UnknownCategory(s.to_string()))
    }
}

/// A named blocking rule. Identity is the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingPreset {
    name: String,
    block_categories: BTreeSet<AppCategory>,
    autodetect: bool,
    enable: bool,
    schedule: BlockSchedule,
}

/// Durable shape of a preset. Every field is optional here so that a missing
/// field is reported as a validation failure instead of a parse failure.
#[derive(Debug, Serialize, Deserialize)]
struct PresetRecord {
    name: Option<String>,
    block_categories: Option<Vec<String>>,
    autodetect: Option<bool>,
    enable: Option<bool>,
    schedule: Option<BlockSchedule>,
}

impl SettingPreset {
    /// Create a disabled preset without autodetection.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is blank or the schedule is inconsistent.
    pub fn new(
        name: impl Into<String>,
        categories: impl IntoIterator<Item = AppCategory>,
        schedule: impl Into<BlockSchedule>,
    ) -> Result<Self, ValidationError> {
        let name = validate_name(name.into())?;
        let schedule = schedule.into();
        schedule.validate()?;

        Ok(Self {
            name,
            block_categories: categories.into_iter().collect(),
            autodetect: false,
            enable: false,
            schedule,
        })
    }

    /// Like [`SettingPreset::new`] but takes textual category codes.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::UnknownCategory`] for an unrecognized code.
    pub fn from_codes<S: AsRef<str>>(
        name: impl Into<String>,
        codes: &[S],
        schedule: impl Into<BlockSchedule>,
    ) -> Result<Self, ValidationError> {
        let categories = parse_codes(codes)?;
        Self::new(name, categories, schedule)
    }

    #[must_use]
    pub fn with_autodetect(mut self, autodetect: bool) -> Self {
        self.autodetect = autodetect;
        self
    }

    #[must_use]
    pub fn with_enable(mut self, enable: bool) -> Self {
        self.enable = enable;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn block_categories(&self) -> &BTreeSet<AppCategory> {
        &self.block_categories
    }

    #[must_use]
    pub fn autodetect(&self) -> bool {
        self.autodetect
    }

    #[must_use]
    pub fn enable(&self) -> bool {
        self.enable
    }

    #[must_use]
    pub fn schedule(&self) -> &BlockSchedule {
        &self.schedule
    }

    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyName`] if `name` is blank.
    pub fn rename(&mut self, name: impl Into<String>) -> Result<(), ValidationError> {
        self.name = validate_name(name.into())?;
        Ok(())
    }

    pub fn set_categories(&mut self, categories: impl IntoIterator<Item = AppCategory>) {
        self.block_categories = categories.into_iter().collect();
    }

    /// # Errors
    ///
    /// Returns an error if the schedule is inconsistent; the preset is left unchanged.
    pub fn set_schedule(&mut self, schedule: impl Into<BlockSchedule>) -> Result<(), ValidationError> {
        let schedule = schedule.into();
        schedule.validate()?;
        self.schedule = schedule;
        Ok(())
    }

    pub fn set_autodetect(&mut self, autodetect: bool) {
        self.autodetect = autodetect;
    }

    pub fn set_enable(&mut self, enable: bool) {
        self.enable = enable;
    }

    /// Whether this preset blocks right now.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>, regular: &dyn RegularEvaluator) -> bool {
        self.enable && self.schedule.is_active(now, regular)
    }

    #[must_use]
    pub fn to_record(&self) -> Value {
        let record = PresetRecord {
            name: Some(self.name.clone()),
            block_categories: Some(
                self.block_categories
                    .iter()
                    .map(|category| category.code().to_string())
                    .collect(),
            ),
            autodetect: Some(self.autodetect),
            enable: Some(self.enable),
            schedule: Some(self.schedule.clone()),
        };
        // A record of plain strings, bools and chrono values always encodes.
        serde_json::to_value(record).unwrap_or(Value::Null)
    }

    /// # Errors
    ///
    /// Returns a [`ValidationError`] if a field is missing, has the wrong
    /// type, or holds an unknown category code.
    pub fn from_record(value: Value) -> Result<Self, ValidationError> {
        let record: PresetRecord = serde_json::from_value(value)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        let name = record.name.ok_or(ValidationError::MissingField("name"))?;
        let codes = record
            .block_categories
            .ok_or(ValidationError::MissingField("block_categories"))?;
        let autodetect = record
            .autodetect
            .ok_or(ValidationError::MissingField("autodetect"))?;
        let enable = record.enable.ok_or(ValidationError::MissingField("enable"))?;
        let schedule = record
            .schedule
            .ok_or(ValidationError::MissingField("schedule"))?;

        Ok(Self::from_codes(name, &codes, schedule)?
            .with_autodetect(autodetect)
            .with_enable(enable))
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        self.to_record().to_string()
    }

    /// # Errors
    ///
    /// Returns a [`ValidationError`] for text that is not a valid preset record.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::from_record(value)
    }

    /// Blocks every category, always, with autodetection. Shipped disabled.
    #[must_use]
    pub fn all_or_nothing() -> Self {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map_or(DateTime::<Utc>::MIN_UTC, |naive| naive.and_utc());

        Self {
            name: "all-or-nothing".to_string(),
            block_categories: AppCategory::all(),
            autodetect: true,
            enable: false,
            schedule: BlockSchedule::Fixed(FixedSchedule::forever_from(epoch)),
        }
    }
}

fn validate_name(name: String) -> Result<String, ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    Ok(name)
}

fn parse_codes<S: AsRef<str>>(codes: &[S]) -> Result<BTreeSet<AppCategory>, ValidationError> {
    codes.iter().map(|code| code.as_ref().parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{InactiveRegular, RegularPattern, RegularSchedule};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn zen() -> SettingPreset {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        SettingPreset::new(
            "zen",
            [AppCategory::Messenger],
            FixedSchedule::for_duration(start, Duration::days(1)).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_category_codes() {
        assert_eq!("messenger".parse::<AppCategory>().unwrap(), AppCategory::Messenger);
        assert_eq!(" Game ".parse::<AppCategory>().unwrap(), AppCategory::Game);
        assert_eq!(
            "podcast".parse::<AppCategory>(),
            Err(ValidationError::UnknownCategory("podcast".to_string()))
        );
        assert_eq!(AppCategory::all().len(), 5);
    }

    #[test]
    fn test_new_rejects_blank_name() {
        let result = SettingPreset::new("  ", [], FixedSchedule::default());
        assert_eq!(result, Err(ValidationError::EmptyName));
    }

    #[test]
    fn test_categories_are_normalized() {
        let preset = SettingPreset::from_codes(
            "mix",
            &["video", "game", "video"],
            FixedSchedule::default(),
        )
        .unwrap();

        let categories: Vec<_> = preset.block_categories().iter().copied().collect();
        assert_eq!(categories, vec![AppCategory::Game, AppCategory::Video]);
    }

    #[test]
    fn test_record_round_trip() {
        let preset = zen().with_autodetect(true).with_enable(true);
        assert_eq!(SettingPreset::from_json(&preset.to_json()).unwrap(), preset);

        let weekly = SettingPreset::new(
            "weekends",
            AppCategory::all(),
            RegularSchedule::new(RegularPattern::Weekends),
        )
        .unwrap();
        assert_eq!(SettingPreset::from_record(weekly.to_record()).unwrap(), weekly);
    }

    #[test]
    fn test_record_is_self_describing() {
        let record = zen().to_record();

        assert_eq!(record["name"], "zen");
        assert_eq!(record["block_categories"], json!(["messenger"]));
        assert_eq!(record["autodetect"], false);
        assert_eq!(record["enable"], false);
        assert_eq!(record["schedule"]["kind"], "fixed");
    }

    #[test]
    fn test_missing_field_is_validation_error() {
        let mut record = zen().to_record();
        record.as_object_mut().unwrap().remove("schedule");

        assert_eq!(
            SettingPreset::from_record(record),
            Err(ValidationError::MissingField("schedule"))
        );
    }

    #[test]
    fn test_unknown_category_is_validation_error() {
        let mut record = zen().to_record();
        record["block_categories"] = json!(["messenger", "casino"]);

        assert_eq!(
            SettingPreset::from_record(record),
            Err(ValidationError::UnknownCategory("casino".to_string()))
        );
    }

    #[test]
    fn test_garbage_is_validation_error() {
        assert!(matches!(
            SettingPreset::from_json("not json"),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            SettingPreset::from_record(json!({"name": 42})),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_is_active_requires_enable() {
        let preset = zen();
        let during = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert!(!preset.is_active(during, &InactiveRegular));
        assert!(preset.with_enable(true).is_active(during, &InactiveRegular));
    }

    #[test]
    fn test_all_or_nothing_blocks_everything() {
        let preset = SettingPreset::all_or_nothing();

        assert_eq!(preset.name(), "all-or-nothing");
        assert_eq!(preset.block_categories(), &AppCategory::all());
        assert!(preset.autodetect());
        assert!(!preset.enable());
        assert!(preset
            .with_enable(true)
            .is_active(Utc::now(), &InactiveRegular));
    }

    #[test]
    fn test_rename_validates() {
        let mut preset = zen();
        assert_eq!(preset.rename(""), Err(ValidationError::EmptyName));
        assert_eq!(preset.name(), "zen");

        preset.rename("deep-work").unwrap();
        assert_eq!(preset.name(), "deep-work");
    }
}
