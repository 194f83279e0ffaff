//! MCP message shapes shared by the client and the in-memory servers.

use crate::error::McpError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use toolhost_types::{ParamSpec, ToolDescriptor};

/// MCP protocol version we speak.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Parameter type assumed when a schema property declares none.
const FALLBACK_PARAM_TYPE: &str = "string";

/// Name and version a server reports during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Text contents of a resource read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    pub text: String,
}

/// Result of a tool call on a built-in server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub text: String,
    pub is_error: bool,
}

impl CallOutcome {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }

    /// The `tools/call` result object.
    pub fn to_result(&self) -> Value {
        json!({
            "content": [{"type": "text", "text": self.text}],
            "isError": self.is_error,
        })
    }
}

/// Render a descriptor as a `tools/list` entry.
pub fn descriptor_to_tool(descriptor: &ToolDescriptor) -> Value {
    let properties: serde_json::Map<String, Value> = descriptor
        .params
        .iter()
        .map(|(name, spec)| {
            (
                name.clone(),
                json!({"type": spec.param_type, "description": spec.description}),
            )
        })
        .collect();
    json!({
        "name": descriptor.name,
        "description": descriptor.description,
        "inputSchema": {
            "type": "object",
            "properties": properties,
            "required": descriptor.required,
        },
    })
}

/// Parse a `tools/list` entry. Only `name` is mandatory.
pub fn tool_from_value(server: &str, tool: &Value) -> Result<ToolDescriptor, McpError> {
    let name = tool
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| McpError::protocol(server, "tools/list entry has no name"))?;
    let description = tool
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let schema = tool.get("inputSchema").unwrap_or(&Value::Null);

    let mut params = BTreeMap::new();
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (param, spec) in properties {
            params.insert(
                param.clone(),
                ParamSpec {
                    param_type: declared_type(spec),
                    description: spec
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
            );
        }
    }
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(ToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        params,
        required,
    })
}

/// `"type": "string"` or `"type": ["string", "null"]`.
fn declared_type(spec: &Value) -> String {
    match spec.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .unwrap_or(FALLBACK_PARAM_TYPE)
            .to_string(),
        _ => FALLBACK_PARAM_TYPE.to_string(),
    }
}

/// Flatten `tools/call` content items into one string.
///
/// Text items are joined with newlines; anything else is kept as JSON text.
pub fn content_to_text(content: &[Value]) -> String {
    content
        .iter()
        .map(|item| match (item.get("type").and_then(Value::as_str), item.get("text")) {
            (Some("text"), Some(Value::String(text))) => text.clone(),
            _ => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pull text out of a `resources/read` result, tolerating odd shapes.
pub fn resource_from_result(uri: &str, result: &Value) -> ResourceContents {
    let first = result
        .get("contents")
        .and_then(Value::as_array)
        .and_then(|items| items.first());
    match first {
        Some(item) => ResourceContents {
            uri: item
                .get("uri")
                .and_then(Value::as_str)
                .unwrap_or(uri)
                .to_string(),
            text: match item.get("text") {
                Some(Value::String(text)) => text.clone(),
                _ => item.to_string(),
            },
        },
        None => ResourceContents {
            uri: uri.to_string(),
            text: result.to_string(),
        },
    }
}
