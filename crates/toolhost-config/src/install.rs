//! Install requests: a JSON batch of server definitions to add.
//!
//! ```json
//! { "servers": { "echo": { "command": "node", "args": ["echo.js"], "approvals": ["all"] } } }
//! ```
//!
//! Each entry is resolved on its own; a bad entry is rejected with a reason
//! and never aborts the rest of the batch.

use crate::server::{BuiltinId, ServerDefinition, ServerEntry, TransportKind};
use serde::Deserialize;
use std::collections::BTreeMap;
use toolhost_permissions::Capability;
use toolhost_types::ConfigError;

/// A parsed install request. Entries stay raw until resolved.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstallRequest {
    #[serde(default, alias = "mcpServers")]
    pub servers: BTreeMap<String, serde_json::Value>,
}

/// One server as written in an install request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallEntry {
    #[serde(default, rename = "type")]
    server_type: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    approvals: Vec<String>,
}

/// A server that could not be installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRejection {
    pub name: String,
    pub reason: String,
}

/// Result of resolving an install request.
#[derive(Debug, Clone, Default)]
pub struct InstallOutcome {
    pub accepted: Vec<(String, ServerDefinition)>,
    pub rejected: Vec<InstallRejection>,
}

/// Parse the JSON text of an install request.
pub fn parse_install_request(json: &str) -> Result<InstallRequest, ConfigError> {
    serde_json::from_str(json).map_err(|e| ConfigError::Parse {
        path: "<install request>".into(),
        message: e.to_string(),
    })
}

/// Resolve every entry of a request into a definition or a rejection.
pub fn resolve_install(request: InstallRequest) -> InstallOutcome {
    let mut outcome = InstallOutcome::default();
    for (name, raw) in request.servers {
        match resolve_entry(&name, raw) {
            Ok(def) => outcome.accepted.push((name, def)),
            Err(reason) => {
                tracing::warn!(server = %name, %reason, "install entry rejected");
                outcome.rejected.push(InstallRejection { name, reason });
            }
        }
    }
    outcome
}

fn resolve_entry(name: &str, raw: serde_json::Value) -> Result<ServerDefinition, String> {
    if name.trim().is_empty() {
        return Err("server name is empty".into());
    }
    let entry: InstallEntry =
        serde_json::from_value(raw).map_err(|e| format!("malformed entry: {e}"))?;

    let command = entry.command.filter(|c| !c.trim().is_empty());
    let base_url = entry.base_url.filter(|u| !u.trim().is_empty());
    if command.is_some() && base_url.is_some() {
        return Err("entry has both command and baseUrl; pick one".into());
    }

    let transport = match entry.server_type.as_deref() {
        Some(t) => TransportKind::parse(t).ok_or_else(|| format!("unknown type '{t}'"))?,
        None if command.is_some() => TransportKind::SpawnedProcess,
        None if base_url.is_some() => TransportKind::Remote,
        None if BuiltinId::from_name(name).is_some() => TransportKind::InMemory,
        None => return Err("entry needs a command, a baseUrl or a built-in name".into()),
    };

    let approvals = entry
        .approvals
        .iter()
        .map(|a| {
            serde_json::from_value::<Capability>(serde_json::Value::String(a.clone()))
                .map_err(|_| format!("unknown approval '{a}'"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let stored = ServerEntry {
        transport,
        command: command.unwrap_or_default(),
        args: entry.args,
        env: entry.env,
        base_url,
        description: entry.description.unwrap_or_default(),
        icon: entry.icon,
        approvals,
        ..Default::default()
    };
    stored.resolve(name).map_err(|e| match e {
        ConfigError::InvalidDefinition { message, .. } => message,
        other => other.to_string(),
    })
}
