use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use workoclock_storage::{AppCategory, SettingPreset};

/// What the currently active presets ask to block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockPlan {
    pub categories: BTreeSet<AppCategory>,
    pub autodetect: bool,
    pub presets: Vec<String>,
}

impl BlockPlan {
    /// Merge the active presets into one plan.
    #[must_use]
    pub fn from_active(active: &[SettingPreset]) -> Self {
        Self {
            categories: active
                .iter()
                .flat_map(|preset| preset.block_categories().iter().copied())
                .collect(),
            autodetect: active.iter().any(SettingPreset::autodetect),
            presets: active.iter().map(|preset| preset.name().to_string()).collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Short human-readable summary, sent to the foreground as status.
    #[must_use]
    pub fn describe(&self) -> String {
        if self.presets.is_empty() {
            return "No active presets".to_string();
        }
        let categories: Vec<&str> = self.categories.iter().map(|c| c.code()).collect();
        let blocked = if categories.is_empty() {
            "nothing".to_string()
        } else {
            categories.join(", ")
        };
        format!("Active: {} | blocking: {blocked}", self.presets.join(", "))
    }
}

/// Platform routine that actually restricts applications
#[async_trait]
pub trait Enforcer: Send + Sync {
    /// Enforce `plan`, replacing whatever was enforced before
    async fn apply(&mut self, plan: &BlockPlan) -> Result<()>;

    /// Lift every restriction
    async fn release(&mut self) -> Result<()>;
}

/// Records plan changes in the log without touching running applications.
#[derive(Debug, Default)]
pub struct LoggingEnforcer {
    current: Option<BlockPlan>,
}

#[async_trait]
impl Enforcer for LoggingEnforcer {
    async fn apply(&mut self, plan: &BlockPlan) -> Result<()> {
        if self.current.as_ref() != Some(plan) {
            log::info!(
                "Blocking categories [{}] (autodetect: {})",
                plan.categories
                    .iter()
                    .map(|c| c.code())
                    .collect::<Vec<_>>()
                    .join(", "),
                plan.autodetect
            );
            self.current = Some(plan.clone());
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        if self.current.take().is_some() {
            log::info!("Released all blocks");
        }
        Ok(())
    }
}

/// Create the enforcer for this platform
#[must_use]
pub fn create_enforcer() -> Box<dyn Enforcer> {
    Box::new(LoggingEnforcer::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use workoclock_storage::FixedSchedule;

    #[test]
    fn test_plan_merges_active_presets() {
        let zen = SettingPreset::new("zen", [AppCategory::Messenger], FixedSchedule::default())
            .unwrap();
        let play = SettingPreset::new(
            "no-play",
            [AppCategory::Game, AppCategory::Messenger],
            FixedSchedule::default(),
        )
        .unwrap()
        .with_autodetect(true);

        let plan = BlockPlan::from_active(&[zen, play]);
        assert_eq!(
            plan.categories,
            [AppCategory::Messenger, AppCategory::Game].into_iter().collect()
        );
        assert!(plan.autodetect);
        assert_eq!(
            plan.describe(),
            "Active: zen, no-play | blocking: messenger, game"
        );
    }

    #[test]
    fn test_empty_plan() {
        let plan = BlockPlan::from_active(&[]);
        assert!(plan.is_empty());
        assert_eq!(plan.describe(), "No active presets");
    }
}
