pub mod error;
pub mod models;
pub mod schedule;
pub mod store;

pub use error::{StoreError, ValidationError};
pub use models::{AppCategory, SettingPreset};
pub use schedule::{
    BlockSchedule, FixedSchedule, InactiveRegular, RegularEvaluator, RegularPattern,
    RegularSchedule,
};
pub use store::{default_presets, PresetStore, DEFAULT_PRESET_NAMES, MAX_PRESETS};
