//! First-time setup: writes the default configuration and seeds the preset file

use anyhow::Result;
use workoclock_core::Config;
use workoclock_storage::PresetStore;

/// Initialize workoclock in the data directory of `config`
///
/// # Errors
///
/// Returns an error if the configuration cannot be written or the preset
/// file exists but fails validation
pub fn init_command(config: &Config) -> Result<()> {
    println!("Initializing WorkOClock...\n");

    println!("Step 1/2: Configuration");
    println!("{}", "-".repeat(40));
    if config.config_path().exists() {
        println!("Configuration already exists at: {}", config.config_path().display());
    } else {
        config.save()?;
        println!("Configuration written to: {}", config.config_path().display());
    }

    println!("\nStep 2/2: Presets");
    println!("{}", "-".repeat(40));
    let store = PresetStore::open(config.presets_path())?;
    let names = store.list()?;
    println!("Preset file: {}", store.path().display());
    println!("Presets ({}/{}): {}", names.len(), store.max_presets(), names.join(", "));

    println!("\n========================================");
    println!("  Setup Complete!");
    println!("========================================");
    println!("\nCreate a preset with: workoclock preset create <name> --all --for-hours 2 --enable");

    Ok(())
}
