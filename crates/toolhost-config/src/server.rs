//! Server definitions: the persisted shape and the resolved, validated shape.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use toolhost_permissions::{ApprovalPolicy, Capability};
use toolhost_types::ConfigError;

/// Default time to wait for a spawned server's readiness line.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 10_000;

/// Default bound on a single protocol round-trip.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Transport kind as written in the config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    SpawnedProcess,
    InMemory,
    Remote,
}

impl TransportKind {
    /// Parse a transport name, accepting the legacy spellings.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "spawned-process" | "stdio" | "process" => Some(Self::SpawnedProcess),
            "in-memory" | "inMemory" | "memory" => Some(Self::InMemory),
            "remote" | "sse" | "http" | "streamable-http" | "streamableHttp" => Some(Self::Remote),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpawnedProcess => "spawned-process",
            Self::InMemory => "in-memory",
            Self::Remote => "remote",
        }
    }
}

/// Built-in servers that run inside the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinId {
    Filesystem,
    Prompts,
}

impl BuiltinId {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "filesystem" => Some(Self::Filesystem),
            "prompts" => Some(Self::Prompts),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Prompts => "prompts",
        }
    }
}

impl fmt::Display for BuiltinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a server is reached, resolved once when the definition is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerKind {
    /// A child process speaking JSON-RPC over stdin/stdout.
    Spawned,
    /// A built-in implementation inside the host process.
    InMemory(BuiltinId),
    /// Reserved for network transports; cannot be started yet.
    Remote { base_url: String },
}

impl ServerKind {
    pub fn transport(&self) -> TransportKind {
        match self {
            Self::Spawned => TransportKind::SpawnedProcess,
            Self::InMemory(_) => TransportKind::InMemory,
            Self::Remote { .. } => TransportKind::Remote,
        }
    }
}

/// A server entry exactly as stored under `[servers.<name>]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerEntry {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub approvals: Vec<Capability>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_phrase: Option<String>,
    // Tables last so the TOML output stays readable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ServerEntry {
    /// Validate and resolve the entry into a definition.
    pub fn resolve(self, name: &str) -> Result<ServerDefinition, ConfigError> {
        let kind = match self.transport {
            TransportKind::SpawnedProcess => ServerKind::Spawned,
            TransportKind::InMemory => {
                let builtin_name = self.builtin.as_deref().unwrap_or(name);
                let id = BuiltinId::from_name(builtin_name).ok_or_else(|| {
                    ConfigError::invalid(name, format!("unknown built-in server '{builtin_name}'"))
                })?;
                ServerKind::InMemory(id)
            }
            TransportKind::Remote => {
                let base_url = self
                    .base_url
                    .clone()
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| ConfigError::invalid(name, "remote server needs a base_url"))?;
                ServerKind::Remote { base_url }
            }
        };

        let definition = ServerDefinition {
            kind,
            command: self.command,
            args: self.args,
            env: self.env,
            cwd: self.cwd,
            description: self.description,
            icon: self.icon,
            approvals: self.approvals.into_iter().collect(),
            enabled: !self.disabled,
            startup_timeout_ms: self.startup_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
            ready_phrase: self.ready_phrase,
        };
        definition.validate(name)?;
        Ok(definition)
    }
}

/// A validated server definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDefinition {
    pub kind: ServerKind,
    pub command: String,
    pub args: Vec<String>,
    /// Merged over the inherited process environment at launch.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub description: String,
    pub icon: Option<String>,
    pub approvals: BTreeSet<Capability>,
    pub enabled: bool,
    pub startup_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    /// Overrides the built-in readiness phrases when set.
    pub ready_phrase: Option<String>,
}

impl ServerDefinition {
    fn with_kind(kind: ServerKind) -> Self {
        Self {
            kind,
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            description: String::new(),
            icon: None,
            approvals: BTreeSet::new(),
            enabled: true,
            startup_timeout_ms: None,
            request_timeout_ms: None,
            ready_phrase: None,
        }
    }

    /// A child-process server.
    pub fn spawned(command: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut def = Self::with_kind(ServerKind::Spawned);
        def.command = command.into();
        def.args = args.into_iter().map(Into::into).collect();
        def
    }

    /// A built-in in-process server.
    pub fn in_memory(id: BuiltinId) -> Self {
        Self::with_kind(ServerKind::InMemory(id))
    }

    /// A network server (configurable, not startable).
    pub fn remote(base_url: impl Into<String>) -> Self {
        Self::with_kind(ServerKind::Remote {
            base_url: base_url.into(),
        })
    }

    pub fn with_approvals(mut self, approvals: impl IntoIterator<Item = Capability>) -> Self {
        self.approvals = approvals.into_iter().collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::invalid(name, "server name is empty"));
        }
        match &self.kind {
            ServerKind::Spawned if self.command.trim().is_empty() => Err(ConfigError::invalid(
                name,
                "spawned-process server needs a non-empty command",
            )),
            ServerKind::Remote { base_url } if base_url.trim().is_empty() => {
                Err(ConfigError::invalid(name, "remote server needs a base_url"))
            }
            _ => Ok(()),
        }
    }

    pub fn policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::new(self.approvals.iter().copied())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms.unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS))
    }

    /// Fill unset timeouts from host-wide defaults.
    pub fn with_defaults(mut self, defaults: &ServerDefaults) -> Self {
        self.startup_timeout_ms = self.startup_timeout_ms.or(defaults.startup_timeout_ms);
        self.request_timeout_ms = self.request_timeout_ms.or(defaults.request_timeout_ms);
        self
    }

    /// Convert back to the persisted shape.
    pub fn to_entry(&self) -> ServerEntry {
        let (builtin, base_url) = match &self.kind {
            ServerKind::Spawned => (None, None),
            ServerKind::InMemory(id) => (Some(id.as_str().to_string()), None),
            ServerKind::Remote { base_url } => (None, Some(base_url.clone())),
        };
        ServerEntry {
            transport: self.kind.transport(),
            builtin,
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            description: self.description.clone(),
            icon: self.icon.clone(),
            approvals: self.approvals.iter().copied().collect(),
            disabled: !self.enabled,
            base_url,
            startup_timeout_ms: self.startup_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
            ready_phrase: self.ready_phrase.clone(),
            env: self.env.clone(),
        }
    }
}

/// Host-wide fallbacks for per-server timeouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefaults {
    #[serde(default)]
    pub startup_timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

/// Partial update merged into an existing definition by `ConfigStore::patch`.
#[derive(Debug, Clone, Default)]
pub struct ServerPatch {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub cwd: Option<PathBuf>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub approvals: Option<Vec<Capability>>,
    pub enabled: Option<bool>,
    pub startup_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub ready_phrase: Option<String>,
}

impl ServerPatch {
    pub fn apply(self, def: &mut ServerDefinition) {
        if let Some(command) = self.command {
            def.command = command;
        }
        if let Some(args) = self.args {
            def.args = args;
        }
        if let Some(env) = self.env {
            def.env = env;
        }
        if let Some(cwd) = self.cwd {
            def.cwd = Some(cwd);
        }
        if let Some(description) = self.description {
            def.description = description;
        }
        if let Some(icon) = self.icon {
            def.icon = Some(icon);
        }
        if let Some(approvals) = self.approvals {
            def.approvals = approvals.into_iter().collect();
        }
        if let Some(enabled) = self.enabled {
            def.enabled = enabled;
        }
        if let Some(ms) = self.startup_timeout_ms {
            def.startup_timeout_ms = Some(ms);
        }
        if let Some(ms) = self.request_timeout_ms {
            def.request_timeout_ms = Some(ms);
        }
        if let Some(phrase) = self.ready_phrase {
            def.ready_phrase = Some(phrase);
        }
    }
}

/// The full set of configured servers plus the default selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSet {
    pub servers: BTreeMap<String, ServerDefinition>,
    /// Ordered default list; the first configured entry is the selected default.
    pub default_servers: Vec<String>,
}

impl ServerSet {
    /// The selected default server, if it is still configured.
    pub fn default_server(&self) -> Option<&str> {
        self.default_servers
            .iter()
            .find(|name| self.servers.contains_key(*name))
            .map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&ServerDefinition> {
        self.servers.get(name)
    }
}
