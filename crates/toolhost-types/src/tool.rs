//! Tool descriptors and the transport-agnostic tool-call types exposed to callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared type and description of a single tool parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
}

/// A tool as reported by a connected server's `tools/list`.
///
/// Never persisted; rebuilt on every enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// Generic (function-calling style) tool definition handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl GenericToolDefinition {
    /// Build a function definition from a descriptor.
    ///
    /// Every declared parameter is listed as required, regardless of what the
    /// server marked as required.
    pub fn from_descriptor(descriptor: &ToolDescriptor) -> Self {
        let properties: serde_json::Map<String, serde_json::Value> = descriptor
            .params
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "type": spec.param_type,
                        "description": spec.description,
                    }),
                )
            })
            .collect();
        let required: Vec<&String> = descriptor.params.keys().collect();

        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: descriptor.name.clone(),
                description: descriptor.description.clone(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }),
            },
        }
    }
}

/// A tool call as produced by the calling conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

/// Name plus serialized JSON arguments, as the model emitted them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl GenericToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: default_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Outcome of a tool call. Always produced, even on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

impl GenericToolResult {
    /// Create a successful text result.
    pub fn text(call: &GenericToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.function.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Create an error text result.
    pub fn error(call: &GenericToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.function.name.clone(),
            content: content.into(),
            is_error: true,
        }
    }
}
