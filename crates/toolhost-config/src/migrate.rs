//! One-time upgrades of legacy `servers.toml` shapes.
//!
//! Runs on the raw TOML table before typed deserialization so obsolete keys
//! can be dropped. Every step is idempotent.

use crate::server::TransportKind;
use toml::{Table, Value};

/// Legacy key for the single default server, superseded by `default_servers`.
const LEGACY_DEFAULT_KEY: &str = "default_server";

/// Legacy name of the built-in filesystem server.
const LEGACY_FILESYSTEM_NAME: &str = "builtin-filesystem";

/// Current name of the built-in filesystem server.
const FILESYSTEM_NAME: &str = "filesystem";

/// Apply all migrations. Returns true if the document changed.
pub fn migrate(doc: &mut Table) -> bool {
    let mut changed = false;
    changed |= migrate_default_server(doc);
    changed |= migrate_legacy_filesystem(doc);
    changed |= normalize_transports(doc);
    changed
}

fn migrate_default_server(doc: &mut Table) -> bool {
    let Some(legacy) = doc.remove(LEGACY_DEFAULT_KEY) else {
        return false;
    };

    let list = doc
        .entry("default_servers")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let (Value::String(name), Value::Array(list)) = (legacy, list) {
        let already = list.iter().any(|v| v.as_str() == Some(name.as_str()));
        if !name.is_empty() && !already {
            list.insert(0, Value::String(name));
        }
    }
    tracing::info!("migrated legacy default_server field");
    true
}

fn migrate_legacy_filesystem(doc: &mut Table) -> bool {
    let Some(Value::Table(servers)) = doc.get_mut("servers") else {
        return false;
    };
    let Some(legacy) = servers.remove(LEGACY_FILESYSTEM_NAME) else {
        return false;
    };

    if !servers.contains_key(FILESYSTEM_NAME) {
        let mut entry = match legacy {
            Value::Table(t) => t,
            _ => Table::new(),
        };
        entry.remove("type");
        entry.remove("command");
        entry.insert(
            "transport".into(),
            Value::String(TransportKind::InMemory.as_str().into()),
        );
        entry.insert("builtin".into(), Value::String(FILESYSTEM_NAME.into()));
        servers.insert(FILESYSTEM_NAME.into(), Value::Table(entry));
    }

    if let Some(Value::Array(defaults)) = doc.get_mut("default_servers") {
        for value in defaults.iter_mut() {
            if value.as_str() == Some(LEGACY_FILESYSTEM_NAME) {
                *value = Value::String(FILESYSTEM_NAME.into());
            }
        }
        let mut seen = Vec::new();
        defaults.retain(|v| {
            let keep = !seen.contains(v);
            seen.push(v.clone());
            keep
        });
    }

    tracing::info!("renamed legacy built-in filesystem server");
    true
}

/// Rename `type` to `transport`, `baseUrl` to `base_url`, and map legacy
/// transport spellings to the current ones.
fn normalize_transports(doc: &mut Table) -> bool {
    let Some(Value::Table(servers)) = doc.get_mut("servers") else {
        return false;
    };

    let mut changed = false;
    for (name, entry) in servers.iter_mut() {
        let Value::Table(entry) = entry else {
            continue;
        };

        if let Some(legacy) = entry.remove("type") {
            if !entry.contains_key("transport") {
                entry.insert("transport".into(), legacy);
            }
            changed = true;
        }
        if let Some(url) = entry.remove("baseUrl") {
            if !entry.contains_key("base_url") {
                entry.insert("base_url".into(), url);
            }
            changed = true;
        }

        if let Some(Value::String(transport)) = entry.get_mut("transport") {
            match TransportKind::parse(transport) {
                Some(kind) if kind.as_str() != transport.as_str() => {
                    *transport = kind.as_str().to_string();
                    changed = true;
                }
                Some(_) => {}
                None => tracing::warn!(server = %name, transport = %transport, "unknown transport kind"),
            }
        }
    }
    changed
}
