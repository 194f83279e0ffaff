//! Persistent server configuration backed by a TOML file.

use crate::migrate::migrate;
use crate::server::{ServerDefaults, ServerDefinition, ServerEntry, ServerPatch, ServerSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use toolhost_types::{ConfigError, EventBus, HostEvent};

/// File name of the server store inside the config directory.
pub const SERVERS_FILE: &str = "servers.toml";

/// On-disk layout of `servers.toml`.
#[derive(Debug, Default, Serialize)]
struct ServersFile {
    default_servers: Vec<String>,
    servers: BTreeMap<String, ServerEntry>,
}

/// Mapping of server name to definition, persisted on every change.
///
/// Reads never fail: a missing or corrupt file yields an empty set.
pub struct ConfigStore {
    path: PathBuf,
    state: Mutex<ServerSet>,
    defaults: ServerDefaults,
    events: EventBus,
}

impl ConfigStore {
    /// Open the store at `path`, migrating legacy shapes on the way in.
    pub fn open(path: impl Into<PathBuf>, events: EventBus) -> Self {
        let path = path.into();
        let state = load_servers_file(&path);
        Self {
            path,
            state: Mutex::new(state),
            defaults: ServerDefaults::default(),
            events,
        }
    }

    /// Open `servers.toml` inside a config directory.
    pub fn in_dir(config_dir: &Path, events: EventBus) -> Self {
        Self::open(config_dir.join(SERVERS_FILE), events)
    }

    /// Use host-wide timeout defaults for definitions that leave them unset.
    pub fn with_defaults(mut self, defaults: ServerDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The full server set plus the default selection.
    pub fn get(&self) -> ServerSet {
        let mut set = self.lock().clone();
        for def in set.servers.values_mut() {
            *def = def.clone().with_defaults(&self.defaults);
        }
        set
    }

    /// Look up a single definition.
    pub fn definition(&self, name: &str) -> Option<ServerDefinition> {
        self.lock()
            .servers
            .get(name)
            .cloned()
            .map(|def| def.with_defaults(&self.defaults))
    }

    /// Name of the selected default server.
    pub fn default_server(&self) -> Option<String> {
        self.lock().default_server().map(str::to_string)
    }

    /// Insert or fully replace a definition.
    pub fn upsert(&self, name: &str, definition: ServerDefinition) -> Result<(), ConfigError> {
        definition.validate(name)?;
        self.commit(Some(name), |set| {
            set.servers.insert(name.to_string(), definition);
            Ok(())
        })
    }

    /// Merge fields into an existing definition.
    pub fn patch(&self, name: &str, patch: ServerPatch) -> Result<ServerDefinition, ConfigError> {
        let mut updated = None;
        self.commit(Some(name), |set| {
            let def = set.servers.get_mut(name).ok_or_else(|| ConfigError::NotFound {
                name: name.to_string(),
            })?;
            patch.apply(def);
            def.validate(name)?;
            updated = Some(def.clone());
            Ok(())
        })?;
        updated.ok_or_else(|| ConfigError::NotFound {
            name: name.to_string(),
        })
    }

    /// Delete a definition. Returns false if it did not exist.
    ///
    /// Stopping a running server first is the caller's responsibility.
    pub fn remove(&self, name: &str) -> Result<bool, ConfigError> {
        if !self.lock().servers.contains_key(name) {
            return Ok(false);
        }
        self.commit(Some(name), |set| {
            set.servers.remove(name);
            set.default_servers.retain(|n| n != name);
            Ok(())
        })?;
        Ok(true)
    }

    /// Make `name` the selected default server.
    pub fn set_default(&self, name: &str) -> Result<(), ConfigError> {
        self.commit(None, |set| {
            if !set.servers.contains_key(name) {
                return Err(ConfigError::NotFound {
                    name: name.to_string(),
                });
            }
            set.default_servers.retain(|n| n != name);
            set.default_servers.insert(0, name.to_string());
            Ok(())
        })
    }

    /// Clear the default selection.
    pub fn clear_default(&self) -> Result<(), ConfigError> {
        self.commit(None, |set| {
            set.default_servers.clear();
            Ok(())
        })
    }

    /// Re-read the file, discarding in-memory state.
    pub fn reload(&self) {
        let state = load_servers_file(&self.path);
        *self.lock() = state;
        self.events.emit(HostEvent::ConfigChanged { name: None });
    }

    /// Apply `mutate` to a copy, persist it, then swap it in. The in-memory
    /// state is untouched if the mutation or the write fails.
    fn commit<F>(&self, name: Option<&str>, mutate: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut ServerSet) -> Result<(), ConfigError>,
    {
        {
            let mut state = self.lock();
            let mut next = state.clone();
            mutate(&mut next)?;
            save_servers_file(&self.path, &next)?;
            *state = next;
        }
        tracing::debug!(server = name.unwrap_or("*"), path = %self.path.display(), "server config saved");
        self.events.emit(HostEvent::ConfigChanged {
            name: name.map(str::to_string),
        });
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerSet> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Load, migrate and resolve `servers.toml`. Never fails.
fn load_servers_file(path: &Path) -> ServerSet {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return ServerSet::default(),
    };

    let mut doc: toml::Table = match toml::from_str(&content) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            return ServerSet::default();
        }
    };

    let migrated = migrate(&mut doc);

    let default_servers = match doc.remove("default_servers") {
        None => Vec::new(),
        Some(value) => Vec::<String>::deserialize(value).unwrap_or_else(|e| {
            tracing::warn!("Ignoring invalid default_servers in {}: {}", path.display(), e);
            Vec::new()
        }),
    };
    let entries = match doc.remove("servers") {
        None => toml::Table::new(),
        Some(toml::Value::Table(entries)) => entries,
        Some(other) => {
            tracing::warn!(
                "Ignoring servers in {}: expected a table, found {}",
                path.display(),
                other.type_str()
            );
            toml::Table::new()
        }
    };

    // Entries are resolved one at a time so a bad one only loses itself.
    let mut set = ServerSet {
        servers: BTreeMap::new(),
        default_servers,
    };
    for (name, value) in entries {
        let resolved = ServerEntry::deserialize(value)
            .map_err(|e| e.to_string())
            .and_then(|entry| entry.resolve(&name).map_err(|e| e.to_string()));
        match resolved {
            Ok(def) => {
                set.servers.insert(name, def);
            }
            Err(e) => tracing::warn!(server = %name, "Skipping server definition: {e}"),
        }
    }

    if migrated {
        match save_servers_file(path, &set) {
            Ok(()) => tracing::info!("Migrated server config at {}", path.display()),
            Err(e) => tracing::warn!("Failed to persist migrated config: {e}"),
        }
    }
    set
}

/// Atomic write: .tmp then rename.
fn save_servers_file(path: &Path, set: &ServerSet) -> Result<(), ConfigError> {
    let file = ServersFile {
        default_servers: set.default_servers.clone(),
        servers: set
            .servers
            .iter()
            .map(|(name, def)| (name.clone(), def.to_entry()))
            .collect(),
    };
    let content = toml::to_string_pretty(&file).map_err(|e| ConfigError::Serialize(e.to_string()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
