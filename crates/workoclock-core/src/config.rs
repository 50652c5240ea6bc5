use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

const CONFIG_FILE: &str = "config.toml";
const PRESETS_FILE: &str = "presets.json";
const PID_FILE: &str = "workoclock.pid";
const LOG_FILE: &str = "workoclock.log";

/// Get the local data directory for workoclock.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    let mut path =
        dirs::data_local_dir().ok_or_else(|| anyhow::anyhow!("Failed to get local data dir"))?;
    path.push("workoclock");
    Ok(path)
}

/// How the background enforcement process is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Prefer a managed service, fall back to a local worker.
    #[default]
    Auto,
    Managed,
    Worker,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Preset file; defaults to `presets.json` in the data directory.
    pub presets_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub host: IpAddr,
    pub foreground_port: u16,
    pub enforcement_port: u16,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            foreground_port: 3000,
            enforcement_port: 3001,
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub fn foreground_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.foreground_port)
    }

    #[must_use]
    pub fn enforcement_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.enforcement_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub mode: ServiceMode,
    pub tick_interval_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            mode: ServiceMode::Auto,
            tick_interval_secs: 10,
            stop_timeout_secs: 5,
        }
    }
}

/// Settings shared by the foreground process and the enforcement process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub channel: ChannelConfig,
    pub service: ServiceConfig,
    #[serde(skip)]
    data_dir: PathBuf,
}

impl Config {
    /// Load the configuration from the default data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory is unknown or the file is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(&get_data_dir()?)
    }

    /// Load `config.toml` from `data_dir`. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or names a
    /// non-loopback channel host.
    pub fn load_from_dir(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config: Config = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("Invalid config: {}", path.display()))?
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Config::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Configuration named by the opaque argument handed to the enforcement
    /// process: the data directory, or empty for the default one.
    ///
    /// # Errors
    ///
    /// Same as [`Config::load_from_dir`].
    pub fn from_service_argument(argument: &str) -> Result<Self> {
        if argument.trim().is_empty() {
            Self::load()
        } else {
            Self::load_from_dir(Path::new(argument))
        }
    }

    /// The argument that makes the enforcement process load this configuration.
    #[must_use]
    pub fn service_argument(&self) -> String {
        self.data_dir.display().to_string()
    }

    /// Write the configuration to `config.toml` in its data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
        let text = toml::to_string_pretty(self).context("Failed to encode config")?;
        fs::write(self.config_path(), text).context("Failed to write config")?;
        Ok(())
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    #[must_use]
    pub fn presets_path(&self) -> PathBuf {
        self.storage
            .presets_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(PRESETS_FILE))
    }

    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join(PID_FILE)
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE)
    }

    fn validate(&self) -> Result<()> {
        if !self.channel.host.is_loopback() {
            anyhow::bail!(
                "control channel host must be a loopback address, got {}",
                self.channel.host
            );
        }
        if self.channel.foreground_port == self.channel.enforcement_port {
            anyhow::bail!("foreground and enforcement ports must differ");
        }
        if self.service.tick_interval_secs == 0 {
            anyhow::bail!("service.tick_interval_secs must be positive");
        }
        Ok(())
    }
}
