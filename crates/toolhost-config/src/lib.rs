//! TOML configuration for toolhost.
//!
//! Two files live in the config directory: `config.toml` for host-wide
//! settings and `servers.toml` for the server store.

pub mod install;
pub mod migrate;
pub mod server;
pub mod store;

pub use install::{InstallOutcome, InstallRejection, InstallRequest, parse_install_request, resolve_install};
pub use server::{
    BuiltinId, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_STARTUP_TIMEOUT_MS, ServerDefaults,
    ServerDefinition, ServerEntry, ServerKind, ServerPatch, ServerSet, TransportKind,
};
pub use store::ConfigStore;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use toolhost_types::EventBus;

/// Resolved host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub config_dir: PathBuf,
    pub defaults: ServerDefaults,
    /// `tracing` filter directive from the settings file, if any.
    pub log_filter: Option<String>,
}

/// Settings that can be read from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub defaults: ServerDefaults,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    pub filter: Option<String>,
}

impl HostConfig {
    /// Load settings from the default config directory.
    pub fn load() -> Self {
        Self::load_from(config_dir())
    }

    /// Load settings from an explicit config directory.
    pub fn load_from(config_dir: PathBuf) -> Self {
        let settings = load_settings_file(&config_dir.join("config.toml"));
        HostConfig {
            config_dir,
            defaults: settings.defaults,
            log_filter: settings.log.filter,
        }
    }

    /// Open the server store in this config directory.
    pub fn open_store(&self, events: EventBus) -> ConfigStore {
        ConfigStore::in_dir(&self.config_dir, events).with_defaults(self.defaults.clone())
    }
}

/// Get the toolhost config directory path (~/.toolhost/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOOLHOST_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolhost")
}

/// Load and parse a TOML settings file, returning defaults on any error.
pub fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}
