//! Durable preset collection.
//!
//! The whole collection lives in one JSON file mapping preset names to preset
//! records. Every operation re-reads and re-validates the file first, and every
//! mutation rewrites the complete collection through a temporary file that is
//! atomically renamed over the original.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::{Result, StoreError, ValidationError};
use crate::models::SettingPreset;

/// Maximum number of presets a collection may hold.
pub const MAX_PRESETS: usize = 10;

/// Names of the system-shipped presets that must always be present.
pub const DEFAULT_PRESET_NAMES: [&str; 1] = ["all-or-nothing"];

/// The system-shipped presets seeded on first run.
#[must_use]
pub fn default_presets() -> Vec<SettingPreset> {
    vec![SettingPreset::all_or_nothing()]
}

type Collection = BTreeMap<String, Value>;

/// CRUD layer over the durable preset file.
///
/// Assumes a single writer. A file changed behind the store's back is only
/// noticed when it breaks validation. Readers open the file with
/// [`PresetStore::open_read_only`], which never creates or rewrites it.
#[derive(Debug)]
pub struct PresetStore {
    path: PathBuf,
    defaults: Vec<SettingPreset>,
    max_presets: usize,
    read_only: bool,
}

impl PresetStore {
    /// Open the store at `path` with the shipped default presets, creating the
    /// file on first run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupted`] if an existing file fails validation,
    /// or an IO error if it cannot be read or created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_defaults(path, default_presets(), MAX_PRESETS)
    }

    /// Open the store with an explicit default set and capacity.
    ///
    /// # Errors
    ///
    /// Same as [`PresetStore::open`].
    pub fn with_defaults(
        path: impl Into<PathBuf>,
        defaults: Vec<SettingPreset>,
        max_presets: usize,
    ) -> Result<Self> {
        let store = Self {
            path: path.into(),
            defaults,
            max_presets,
            read_only: false,
        };
        let collection = store.load_and_validate()?;
        log::info!(
            "Preset storage ready at: {} ({} presets)",
            store.path.display(),
            collection.len()
        );
        Ok(store)
    }

    /// Open an existing preset file for reading. A missing file is reported
    /// as [`StoreError::Missing`] instead of being bootstrapped, and every
    /// mutation fails with [`StoreError::ReadOnly`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] if the file does not exist and
    /// [`StoreError::Corrupted`] if it fails validation.
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            defaults: default_presets(),
            max_presets: MAX_PRESETS,
            read_only: true,
        };
        store.load_and_validate()?;
        log::info!("Reading presets from: {}", store.path.display());
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn max_presets(&self) -> usize {
        self.max_presets
    }

    /// Names of all stored presets.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be loaded or fails validation.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.load_and_validate()?.into_keys().collect())
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown name and
    /// [`StoreError::Validation`] for an undecodable record.
    pub fn get(&self, name: &str) -> Result<SettingPreset> {
        let mut collection = self.load_and_validate()?;
        let record = collection.remove(name).ok_or_else(|| StoreError::NotFound {
            name: name.to_string(),
        })?;
        decode(name, record)
    }

    /// Every decodable preset. Undecodable records are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be loaded or fails validation.
    pub fn load_all(&self) -> Result<Vec<SettingPreset>> {
        let collection = self.load_and_validate()?;
        let mut presets = Vec::with_capacity(collection.len());
        for (name, record) in collection {
            match decode(&name, record) {
                Ok(preset) => presets.push(preset),
                Err(e) => log::warn!("Skipping unreadable preset '{name}': {e}"),
            }
        }
        Ok(presets)
    }

    /// Insert `preset`. With `exist_ok` an existing preset of the same name is
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Capacity`] when the store is full and
    /// [`StoreError::AlreadyExists`] on a name clash without `exist_ok`.
    pub fn create(&self, preset: &SettingPreset, exist_ok: bool) -> Result<()> {
        let mut collection = self.load_and_validate()?;
        if collection.len() >= self.max_presets {
            return Err(StoreError::Capacity {
                max: self.max_presets,
            });
        }
        if !exist_ok && collection.contains_key(preset.name()) {
            return Err(StoreError::AlreadyExists {
                name: preset.name().to_string(),
            });
        }

        collection.insert(preset.name().to_string(), preset.to_record());
        self.persist(&collection)?;
        log::info!("Stored preset '{}'", preset.name());
        Ok(())
    }

    /// Replace the preset stored as `old_name` with `preset`, which may carry a
    /// different name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `old_name` is unknown and
    /// [`StoreError::AlreadyExists`] if the new name belongs to another preset.
    pub fn update(&self, old_name: &str, preset: &SettingPreset) -> Result<()> {
        let mut collection = self.load_and_validate()?;
        if !collection.contains_key(old_name) {
            return Err(StoreError::NotFound {
                name: old_name.to_string(),
            });
        }
        if preset.name() != old_name && collection.contains_key(preset.name()) {
            return Err(StoreError::AlreadyExists {
                name: preset.name().to_string(),
            });
        }

        collection.remove(old_name);
        collection.insert(preset.name().to_string(), preset.to_record());
        self.persist(&collection)?;
        if preset.name() == old_name {
            log::info!("Updated preset '{old_name}'");
        } else {
            log::info!("Updated preset '{old_name}' (renamed to '{}')", preset.name());
        }
        Ok(())
    }

    /// Remove `name`. Without `strict` an unknown name is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown name in strict mode.
    pub fn delete(&self, name: &str, strict: bool) -> Result<()> {
        let mut collection = self.load_and_validate()?;
        if collection.remove(name).is_none() {
            if strict {
                return Err(StoreError::NotFound {
                    name: name.to_string(),
                });
            }
            log::debug!("Preset '{name}' already absent, nothing to delete");
            return Ok(());
        }

        self.persist(&collection)?;
        log::info!("Deleted preset '{name}'");
        Ok(())
    }

    fn load_and_validate(&self) -> Result<Collection> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.read_only {
                    return Err(StoreError::Missing {
                        path: self.path.clone(),
                    });
                }
                return self.bootstrap();
            }
            Err(e) => return Err(e.into()),
        };

        let collection: Collection =
            serde_json::from_str(&text).map_err(|e| StoreError::Corrupted {
                reason: format!("{} is not a preset collection: {e}", self.path.display()),
            })?;

        if collection.len() > self.max_presets {
            return Err(StoreError::Corrupted {
                reason: format!(
                    "{} presets stored, the limit is {}",
                    collection.len(),
                    self.max_presets
                ),
            });
        }

        let missing: Vec<&str> = self
            .defaults
            .iter()
            .map(SettingPreset::name)
            .filter(|name| !collection.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::Corrupted {
                reason: format!("default presets are missing: {}", missing.join(", ")),
            });
        }

        Ok(collection)
    }

    fn bootstrap(&self) -> Result<Collection> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let collection: Collection = self
            .defaults
            .iter()
            .map(|preset| (preset.name().to_string(), preset.to_record()))
            .collect();
        self.persist(&collection)?;

        log::info!(
            "Initialized preset storage at: {} with {} default presets",
            self.path.display(),
            collection.len()
        );
        Ok(collection)
    }

    fn persist(&self, collection: &Collection) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly {
                path: self.path.clone(),
            });
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, collection)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn decode(key: &str, record: Value) -> Result<SettingPreset> {
    let preset = SettingPreset::from_record(record)?;
    if preset.name() != key {
        return Err(ValidationError::Malformed(format!(
            "record stored as '{key}' is named '{}'",
            preset.name()
        ))
        .into());
    }
    Ok(preset)
}
